//! Bot token scrubbing for every log sink.
//!
//! Telegram puts the bot token in the request path (`/bot<id>:<secret>/<method>`),
//! so any error that echoes a URL would leak it. The writer below rewrites
//! the formatted bytes before they reach stderr or the JSONL file.

use std::io;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

pub const REDACTED_BOT: &str = "bot[REDACTED]";

static BOT_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bot\d+:[A-Za-z0-9_-]+").expect("valid bot token regex"));

/// Replace every `bot<id>:<secret>` occurrence with [`REDACTED_BOT`].
pub fn redact_bot_token(input: &str) -> String {
    BOT_TOKEN_RE.replace_all(input, REDACTED_BOT).into_owned()
}

#[derive(Debug, Clone)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}

pub struct RedactingWriter<W> {
    inner: W,
}

impl<W> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        if BOT_TOKEN_RE.is_match(&text) {
            self.inner.write_all(redact_bot_token(&text).as_bytes())?;
        } else {
            self.inner.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn redacts_token_in_url() {
        let url = "https://api.telegram.org/bot123:abcDEF_ghij/sendMessage";
        assert_eq!(
            redact_bot_token(url),
            "https://api.telegram.org/bot[REDACTED]/sendMessage"
        );
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(redact_bot_token("robot 42 is fine"), "robot 42 is fine");
    }

    #[test]
    fn writer_scrubs_bytes() {
        let mut out = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut out);
            writer
                .write_all(b"error sending request for url (https://api.telegram.org/bot99:XyZ-_1/getUpdates)")
                .unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("XyZ-_1"));
        assert!(text.contains(REDACTED_BOT));
    }

    #[test]
    fn subscriber_output_never_contains_token() {
        let buf = SharedBuf::default();
        let sink = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(RedactingMakeWriter::new(move || sink.clone()))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(
                url = "https://api.telegram.org/bot123:abcDEF_ghij/getUpdates",
                "telegram request failed"
            );
        });

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(!text.contains("123:abcDEF_ghij"));
        assert!(text.contains(REDACTED_BOT));
    }
}
