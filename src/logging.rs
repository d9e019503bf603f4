//! Root logger construction.
//!
//! Lives in the library rather than the binary because a freshly forked
//! child has to rebuild its logger: the async drain's worker thread does
//! not survive the fork.

use crate::configuration::{LogConfig, LogFormat, LogOutput};
use slog::{o, Drain, Logger};
use slog_json::Json;
use slog_logfmt::Logfmt;
use std::io;

pub fn root_logger(config: &LogConfig) -> Logger {
    let output: Box<dyn io::Write + Send + Sync> = match config.output {
        LogOutput::Stderr => Box::new(io::stderr()),
        LogOutput::Stdout => Box::new(io::stdout()),
    };
    match config.format {
        LogFormat::Json => {
            let drain = Json::new(output)
                .add_default_keys()
                .build()
                .filter_level(config.level.into())
                .fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!("logger" => "refork"))
        }
        LogFormat::Logfmt { print_prefix } => {
            let mut builder = Logfmt::new(output);
            if !print_prefix {
                builder = builder.no_prefix().print_msg(true);
            }
            let drain = builder.build().filter_level(config.level.into()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!("logger" => "refork"))
        }
    }
}
