use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use tokio_util::codec::Decoder;

use std::fmt;
use std::marker::PhantomData;

use crate::errors::Error;

/// Result type for the exec output stream of the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LogOutput {
    StdErr { message: String },
    StdOut { message: String },
    StdIn { message: String },
    Console { message: String },
}

impl fmt::Display for LogOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match &self {
            LogOutput::StdErr { message } => message,
            LogOutput::StdOut { message } => message,
            LogOutput::StdIn { message } => message,
            LogOutput::Console { message } => message,
        };
        write!(f, "{message}")
    }
}

const HEADER_LEN: usize = 8;

/// Decodes the multiplexed stream the daemon sends for non-tty exec instances: every frame is
/// an 8 byte header (stream type, three padding bytes, big-endian payload length) followed by
/// the payload.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct LogOutputDecoder {}

impl LogOutputDecoder {
    pub(crate) fn new() -> LogOutputDecoder {
        LogOutputDecoder {}
    }
}

impl Decoder for LogOutputDecoder {
    type Item = LogOutput;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let stream_type = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(length);
        let message = String::from_utf8_lossy(&payload).into_owned();

        let item = match stream_type {
            0 => LogOutput::StdIn { message },
            1 => LogOutput::StdOut { message },
            2 => LogOutput::StdErr { message },
            _ => {
                debug!("LogOutputDecoder found unknown stream type {stream_type}");
                LogOutput::Console { message }
            }
        };
        Ok(Some(item))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // a truncated trailing frame is surfaced as raw console output
            None => {
                let rest = src.split();
                Ok(Some(LogOutput::Console {
                    message: String::from_utf8_lossy(&rest).into_owned(),
                }))
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct JsonLineDecoder<T> {
    ty: PhantomData<T>,
}

impl<T> JsonLineDecoder<T> {
    #[inline]
    pub(crate) fn new() -> JsonLineDecoder<T> {
        JsonLineDecoder { ty: PhantomData }
    }
}

impl<T> Decoder for JsonLineDecoder<T>
where
    T: DeserializeOwned,
{
    type Item = T;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let nl_index = src.iter().position(|b| *b == b'\n');

            let Some(pos) = nl_index else {
                return Ok(None);
            };

            let slice = src.split_to(pos + 1);
            let slice = slice[..slice.len() - 1].trim_ascii();
            if slice.is_empty() {
                continue;
            }

            return crate::Docker::decode_json(slice).map(Some);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            return Ok(None);
        }
        if !src.ends_with(b"\n") {
            src.extend_from_slice(b"\n");
        }
        self.decode(src)
    }
}

/// Runs a decoder over a fully buffered body.
pub(crate) fn decode_all<D>(mut decoder: D, body: &[u8]) -> Result<Vec<D::Item>, D::Error>
where
    D: Decoder,
{
    let mut buf = BytesMut::from(body);
    let mut items = Vec::new();
    while let Some(item) = decoder.decode_eof(&mut buf)? {
        items.push(item);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateImageInfo;

    fn frame(stream: u8, payload: &str) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload.as_bytes());
        out
    }

    #[test]
    fn demultiplexes_stdout_and_stderr() {
        let mut body = frame(1, "ffmpeg version 6.1.1\n");
        body.extend(frame(2, "warning: deprecated\n"));
        body.extend(frame(1, ""));

        let items = decode_all(LogOutputDecoder::new(), &body).unwrap();
        assert_eq!(
            items,
            vec![
                LogOutput::StdOut {
                    message: "ffmpeg version 6.1.1\n".into()
                },
                LogOutput::StdErr {
                    message: "warning: deprecated\n".into()
                },
                LogOutput::StdOut {
                    message: String::new()
                },
            ]
        );
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let body = frame(1, "Successfully installed ffmpy-0.3.2");
        let mut buf = BytesMut::from(&body[..12]);
        assert_eq!(LogOutputDecoder::new().decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&body[12..]);
        assert!(matches!(
            LogOutputDecoder::new().decode(&mut buf).unwrap(),
            Some(LogOutput::StdOut { .. })
        ));
    }

    #[test]
    fn truncated_trailer_is_not_lost() {
        let mut body = frame(2, "ERROR");
        body.extend_from_slice(&[1, 0, 0]);
        let items = decode_all(LogOutputDecoder::new(), &body).unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], LogOutput::Console { .. }));
    }

    #[test]
    fn json_lines_skip_blank_lines() {
        let body = b"{\"status\":\"Pulling from n8nio/n8n\",\"id\":\"latest\"}\r\n\n{\"status\":\"Done\"}";
        let items: Vec<CreateImageInfo> =
            decode_all(JsonLineDecoder::new(), body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id.as_deref(), Some("latest"));
        assert_eq!(items[1].status.as_deref(), Some("Done"));
    }
}
