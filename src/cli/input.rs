use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

use crate::bulk::{document_from_bytes, Action, ActionParams, Verb};

/// How each input document becomes an action
#[derive(Debug, Clone)]
pub struct ActionTemplate {
    pub verb: Verb,
    pub index: Option<String>,
    pub pipeline: Option<String>,
    /// Document field copied into `_id`
    pub id_field: Option<String>,
}

impl ActionTemplate {
    pub fn build(&self, document: Value) -> Action {
        let id = self
            .id_field
            .as_deref()
            .and_then(|field| document.get(field))
            .and_then(|value| match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        let params = ActionParams {
            id,
            index: self.index.clone(),
            pipeline: self.pipeline.clone(),
            ..Default::default()
        };
        let document = self.verb.has_source().then_some(document);
        Action::new(self.verb, params, document)
    }
}

/// Newline-delimited JSON documents read in batches
pub struct NdjsonSource<R> {
    reader: R,
    template: ActionTemplate,
    line_number: usize,
    skipped: usize,
    eof: bool,
}

impl<R: AsyncBufRead + Unpin> NdjsonSource<R> {
    pub fn new(reader: R, template: ActionTemplate) -> Self {
        Self {
            reader,
            template,
            line_number: 0,
            skipped: 0,
            eof: false,
        }
    }

    /// Lines that were not valid JSON objects
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Up to `size` actions; `None` once the input is exhausted
    pub async fn next_batch(&mut self, size: usize) -> Result<Option<Vec<Action>>> {
        let mut batch = Vec::with_capacity(size);
        let mut line = Vec::new();

        while batch.len() < size && !self.eof {
            line.clear();
            if self.reader.read_until(b'\n', &mut line).await? == 0 {
                self.eof = true;
                break;
            }
            self.line_number += 1;

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match document_from_bytes(&line) {
                Ok(document @ Value::Object(_)) => batch.push(self.template.build(document)),
                Ok(_) => {
                    self.skipped += 1;
                    warn!(line = self.line_number, "Skipping input line that is not a JSON object");
                }
                Err(e) => {
                    self.skipped += 1;
                    warn!(line = self.line_number, error = %e, "Skipping unparsable input line");
                }
            }
        }

        if batch.is_empty() && self.eof {
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(verb: Verb) -> ActionTemplate {
        ActionTemplate {
            verb,
            index: Some("logs".into()),
            pipeline: None,
            id_field: Some("id".into()),
        }
    }

    #[tokio::test]
    async fn test_reads_in_batches_and_skips_bad_lines() {
        let input = b"{\"id\":1,\"m\":\"a\"}\n\nnot json\n[1,2]\n{\"id\":\"x\"}\n{\"m\":\"c\"}";
        let mut source = NdjsonSource::new(&input[..], template(Verb::Index));

        let first = source.next_batch(2).await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].params.id.as_deref(), Some("1"));
        assert_eq!(first[0].params.index.as_deref(), Some("logs"));
        assert_eq!(first[1].params.id.as_deref(), Some("x"));

        let second = source.next_batch(2).await.unwrap().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].params.id, None);
        assert_eq!(second[0].document, Some(json!({ "m": "c" })));

        assert!(source.next_batch(2).await.unwrap().is_none());
        assert_eq!(source.skipped(), 2);
    }

    #[tokio::test]
    async fn test_delete_drops_the_document() {
        let input = b"{\"id\":\"gone\"}\n";
        let mut source = NdjsonSource::new(&input[..], template(Verb::Delete));
        let batch = source.next_batch(10).await.unwrap().unwrap();
        assert_eq!(batch[0].verb, Verb::Delete);
        assert_eq!(batch[0].params.id.as_deref(), Some("gone"));
        assert!(batch[0].document.is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let input = b"{\"m\":\"caf\xe9\"}\n";
        let mut source = NdjsonSource::new(&input[..], template(Verb::Create));
        let batch = source.next_batch(10).await.unwrap().unwrap();
        assert_eq!(batch[0].document, Some(json!({ "m": "caf\u{fffd}" })));
    }
}
