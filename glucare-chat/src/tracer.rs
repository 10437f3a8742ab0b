//! Logging setup for processes embedding the chat core.

use shared::config::chat::ChatConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;

/// Installs the global tracing subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.log_level`. Returns the
/// configured level; installing is skipped when a subscriber already exists.
pub fn initialize_tracing(config: &ChatConfig) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    // Embedders may have installed their own subscriber already.
    let _ = if config.log_json {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };

    config.log_level.clone()
}

fn build_env_filter(config: &ChatConfig) -> EnvFilter {
    let default_level = config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::{
        io::{self, Write},
        sync::{Arc, Mutex},
    };
    use tracing::{Subscriber, info};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct BufferMakeWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    struct BufferWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for BufferMakeWriter {
        type Writer = BufferWriter;

        fn make_writer(&'a self) -> Self::Writer {
            BufferWriter {
                buffer: Arc::clone(&self.buffer),
            }
        }
    }

    impl Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn subscriber_with_writer<W>(config: &ChatConfig, writer: W) -> Box<dyn Subscriber + Send + Sync>
    where
        W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    {
        let builder = fmt::fmt()
            .with_env_filter(build_env_filter(config))
            .with_target(false)
            .with_writer(writer);

        if config.log_json {
            Box::new(builder.json().with_ansi(false).finish())
        } else {
            Box::new(builder.with_ansi(false).finish())
        }
    }

    fn first_line(config: &ChatConfig) -> String {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = subscriber_with_writer(
            config,
            BufferMakeWriter {
                buffer: Arc::clone(&buffer),
            },
        );
        let dispatch = tracing::dispatcher::Dispatch::new(subscriber);

        tracing::dispatcher::with_default(&dispatch, || {
            info!(conversation_id = "c1", "live channel active");
        });

        let contents = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        contents
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_initialize_tracing_returns_configured_level() {
        let config = ChatConfig::with_defaults();
        assert_eq!(initialize_tracing(&config), "info");
        // A second call must not panic.
        assert_eq!(initialize_tracing(&config), "info");
    }

    #[test]
    fn test_json_logs_carry_fields() {
        let config = ChatConfig {
            log_json: true,
            ..ChatConfig::with_defaults()
        };

        let value: Value = serde_json::from_str(&first_line(&config)).unwrap();
        assert_eq!(value["fields"]["message"], "live channel active");
        assert_eq!(value["fields"]["conversation_id"], "c1");
    }

    #[test]
    fn test_text_logs_are_plain() {
        let line = first_line(&ChatConfig::with_defaults());

        assert!(serde_json::from_str::<Value>(&line).is_err());
        assert!(line.contains("live channel active"));
    }
}
