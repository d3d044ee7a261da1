//! Server side include templates.
use std::sync::Arc;
use std::task::Poll;

use bytes::Bytes;

use super::Handler;
use crate::buf::{Buf, Flags};
use crate::chain::Chain;
use crate::error::Error;
use crate::log::warning;
use crate::request::{ChildOptions, Request};
use crate::response::{ResponseHead, StatusCode};

const DIRECTIVE_ERROR: &[u8] = b"[an error occurred while processing the directive]";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(Bytes),
    Include(String),
    Invalid,
}

/// HTML template with `<!--# include virtual="/uri" -->` directives.
///
/// Every directive is replaced by the output of a subrequest to its target, in place.
#[derive(Debug, Clone)]
pub struct Include {
    parts: Arc<[Part]>,
}

impl Include {
    pub fn new(template: &str) -> Self {
        Self { parts: parse(template).into() }
    }
}

fn parse(template: &str) -> Vec<Part> {
    let mut parts = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("<!--#") {
        let Some(len) = rest[start..].find("-->") else {
            break;
        };
        if start > 0 {
            parts.push(Part::Text(Bytes::copy_from_slice(rest[..start].as_bytes())));
        }
        parts.push(match parse_directive(&rest[start + 5..start + len]) {
            Some(uri) => Part::Include(uri),
            None => Part::Invalid,
        });
        rest = &rest[start + len + 3..];
    }

    if !rest.is_empty() {
        parts.push(Part::Text(Bytes::copy_from_slice(rest.as_bytes())));
    }
    parts
}

fn parse_directive(directive: &str) -> Option<String> {
    let params = directive.trim().strip_prefix("include")?.trim_start();
    let value = params
        .strip_prefix("virtual=")
        .or_else(|| params.strip_prefix("file="))?
        .strip_prefix('"')?;
    let end = value.find('"')?;
    Some(value[..end].to_owned())
}

impl Handler for Include {
    fn handle(&mut self, req: &mut Request<'_>) -> Poll<Result<StatusCode, Error>> {
        req.send_header(ResponseHead::new(StatusCode::OK).header("Content-Type", "text/html"))?;

        let mut chain = Chain::new();
        for part in self.parts.iter() {
            let text = match part {
                Part::Text(text) => text.clone(),
                Part::Invalid => Bytes::from_static(DIRECTIVE_ERROR),
                Part::Include(uri) => {
                    // text before the directive precedes the subrequest
                    if !chain.is_empty() {
                        if let Poll::Ready(Err(err)) = req.submit(std::mem::take(&mut chain)) {
                            return Poll::Ready(Err(err));
                        }
                    }
                    match req.create_child(uri, ChildOptions::default()) {
                        Ok(_) => continue,
                        Err(err) if !err.is_fatal() => {
                            warning!("include \"{uri}\": {err}");
                            Bytes::from_static(DIRECTIVE_ERROR)
                        }
                        Err(err) => return Poll::Ready(Err(err)),
                    }
                }
            };
            if let Err(err) = req.pool().push_new(&mut chain, Buf::from_bytes(text)) {
                req.pool().discard_chain(chain);
                return Poll::Ready(Err(err.into()));
            }
        }

        if let Err(err) = req.pool().push_new(&mut chain, Buf::sentinel(Flags::LAST)) {
            req.pool().discard_chain(chain);
            return Poll::Ready(Err(err.into()));
        }
        if let Poll::Ready(Err(err)) = req.submit(chain) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(StatusCode::OK))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_template() {
        let parts = parse(r#"<p>A<!--# include virtual="/x" -->B<!--# echo var="y" --></p>"#);
        assert_eq!(
            parts,
            [
                Part::Text(Bytes::from_static(b"<p>A")),
                Part::Include("/x".into()),
                Part::Text(Bytes::from_static(b"B")),
                Part::Invalid,
                Part::Text(Bytes::from_static(b"</p>")),
            ]
        );
    }

    #[test]
    fn unterminated_directive_is_text() {
        let parts = parse("a<!--# include");
        assert_eq!(parts, [Part::Text(Bytes::from_static(b"a<!--# include"))]);
        assert_eq!(parse_directive(" include file=\"/f\" "), Some("/f".into()));
        assert_eq!(parse_directive("include virtual=/f"), None);
    }
}
