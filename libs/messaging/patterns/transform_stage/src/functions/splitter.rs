use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

use crate::metadata::StageCounters;
use crate::record::{CORRELATION_ID, SEQUENCE_NUMBER, SEQUENCE_SIZE};
use crate::{
    CompletionSignal, Expression, Payload, Record, Stage, StageError, StageMetadata,
};

pub const DEFAULT_DELIMITERS: &str = ",";

/// How a payload is cut into fragments
#[derive(Debug, Clone, PartialEq)]
pub enum SplitMode {
    /// Split text on any of these characters; arrays split per element
    Delimiters(String),
    /// Evaluate, then split the resulting array per element
    Expression(Expression),
}

/// Turns one record into an ordered list of fragment records
#[derive(Debug, Clone, PartialEq)]
pub struct Splitter {
    mode: SplitMode,
    apply_sequence: bool,
}

impl Splitter {
    pub fn delimiters(delimiters: impl Into<String>) -> Result<Self, StageError> {
        let delimiters = delimiters.into();
        if delimiters.is_empty() {
            return Err(StageError::configuration("splitter delimiters cannot be empty"));
        }
        Ok(Self {
            mode: SplitMode::Delimiters(delimiters),
            apply_sequence: true,
        })
    }

    pub fn expression(expression: Expression) -> Self {
        Self {
            mode: SplitMode::Expression(expression),
            apply_sequence: true,
        }
    }

    /// Build from the `delimiters`/`expression` option pair; at most one may be set
    pub fn from_options(
        delimiters: Option<&str>,
        expression: Option<&Expression>,
    ) -> Result<Self, StageError> {
        match (delimiters, expression) {
            (Some(_), Some(_)) => Err(StageError::configuration(
                "splitter 'delimiters' and 'expression' are mutually exclusive",
            )),
            (None, Some(expr)) => Ok(Self::expression(expr.clone())),
            (Some(d), None) => Self::delimiters(d),
            (None, None) => Self::delimiters(DEFAULT_DELIMITERS),
        }
    }

    pub fn with_apply_sequence(mut self, apply_sequence: bool) -> Self {
        self.apply_sequence = apply_sequence;
        self
    }

    pub fn mode(&self) -> &SplitMode {
        &self.mode
    }

    /// Split `record` into fragments, in payload order
    pub fn split(&self, record: &Record) -> Result<Vec<Record>, StageError> {
        let parts = match &self.mode {
            SplitMode::Delimiters(delimiters) => split_payload(record.payload(), delimiters),
            SplitMode::Expression(expr) => match expr.evaluate(record)? {
                Value::Array(items) => items.into_iter().map(Payload::from_value).collect(),
                Value::Null => {
                    return Err(StageError::evaluation(
                        expr.source(),
                        "split expression evaluated to null",
                    ))
                }
                scalar => vec![Payload::from_value(scalar)],
            },
        };

        let size = parts.len();
        let fragments = parts
            .into_iter()
            .enumerate()
            .map(|(index, payload)| {
                let builder = Record::builder(payload).headers(record.headers().clone());
                let builder = if self.apply_sequence {
                    builder
                        .header(CORRELATION_ID, record.id().to_string())
                        .header(SEQUENCE_NUMBER, index + 1)
                        .header(SEQUENCE_SIZE, size)
                } else {
                    builder
                };
                builder.build()
            })
            .collect();

        Ok(fragments)
    }
}

impl fmt::Display for Splitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            SplitMode::Delimiters(delimiters) => write!(f, "split on '{}'", delimiters),
            SplitMode::Expression(expr) => write!(f, "#{{{}}}", expr.source()),
        }
    }
}

fn split_payload(payload: &Payload, delimiters: &str) -> Vec<Payload> {
    match payload {
        Payload::Text(text) => text
            .split(|c: char| delimiters.contains(c))
            .filter(|token| !token.is_empty())
            .map(Payload::from)
            .collect(),
        Payload::Structured(Value::Array(items)) => {
            items.iter().cloned().map(Payload::from_value).collect()
        }
        other => vec![other.clone()],
    }
}

/// `[stages.<name>]` options for `type = "splitter"`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SplitterConfig {
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub delimiters: Option<String>,
    pub expression: Option<Expression>,
}

impl SplitterConfig {
    pub fn validate(&self) -> Result<(), StageError> {
        Splitter::from_options(self.delimiters.as_deref(), self.expression.as_ref()).map(|_| ())
    }
}

/// Function stage emitting the fragments of each record as one JSON array
#[derive(Debug)]
pub struct SplitterFunction {
    name: String,
    splitter: Splitter,
    decode_text: bool,
    counters: StageCounters,
}

impl SplitterFunction {
    pub fn new(name: impl Into<String>, splitter: Splitter, decode_text: bool) -> Self {
        Self {
            name: name.into(),
            splitter,
            decode_text,
            counters: StageCounters::new(),
        }
    }

    pub fn splitter(&self) -> &Splitter {
        &self.splitter
    }

    fn apply(&self, record: Record) -> Result<Record, StageError> {
        let record = if self.decode_text {
            record.decode_text()
        } else {
            record
        };
        let fragments = self.splitter.split(&record)?;
        debug!(stage = %self.name, fragments = fragments.len(), "Split record");

        let values = fragments.iter().map(|f| f.payload().to_value()).collect();
        Ok(record.with_payload(Value::Array(values)))
    }
}

#[async_trait]
impl Stage for SplitterFunction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, record: Record) -> CompletionSignal {
        let signal = match self.apply(record) {
            Ok(out) => CompletionSignal::AcceptedWith(out),
            Err(err) => CompletionSignal::Rejected(err),
        };
        self.counters.observe(&signal);
        signal
    }

    fn metadata(&self) -> StageMetadata {
        self.counters.fill(StageMetadata::new(&self.name, "splitter"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delimiter_split_with_sequence_headers() {
        let record = Record::builder("a,b;;c").header("dest", "Q").build();
        let splitter = Splitter::delimiters(",;").unwrap();
        let fragments = splitter.split(&record).unwrap();

        assert_eq!(fragments.len(), 3);
        let texts: Vec<_> = fragments.iter().map(|f| f.payload().as_text().unwrap()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);

        for (i, fragment) in fragments.iter().enumerate() {
            assert_eq!(
                fragment.header_str(CORRELATION_ID),
                Some(record.id().to_string())
            );
            assert_eq!(fragment.header(SEQUENCE_NUMBER), Some(&json!(i + 1)));
            assert_eq!(fragment.header(SEQUENCE_SIZE), Some(&json!(3)));
            assert_eq!(fragment.header_str("dest").as_deref(), Some("Q"));
        }
    }

    #[test]
    fn test_sequence_headers_can_be_disabled() {
        let splitter = Splitter::delimiters(",").unwrap().with_apply_sequence(false);
        let fragments = splitter.split(&Record::new("x,y")).unwrap();
        assert!(fragments[0].header(SEQUENCE_NUMBER).is_none());
        assert!(fragments[0].header(CORRELATION_ID).is_none());
    }

    #[test]
    fn test_structured_array_split_per_element() {
        let splitter = Splitter::delimiters(",").unwrap();
        let fragments = splitter
            .split(&Record::new(json!([{"id": 1}, "two", 3])))
            .unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].payload(), &Payload::Structured(json!({"id": 1})));
        assert_eq!(fragments[1].payload(), &Payload::Text("two".to_string()));
    }

    #[test]
    fn test_bytes_payload_is_single_fragment() {
        let splitter = Splitter::delimiters(",").unwrap();
        let fragments = splitter.split(&Record::new(b"a,b".to_vec())).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].payload().is_bytes());
    }

    #[test]
    fn test_expression_split() {
        let expr = Expression::parse("payload.split('-')").unwrap();
        let fragments = Splitter::expression(expr).split(&Record::new("1-2")).unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].payload().as_text(), Some("2"));

        let scalar = Expression::parse("headers['one']").unwrap();
        let record = Record::builder("p").header("one", "only").build();
        assert_eq!(Splitter::expression(scalar).split(&record).unwrap().len(), 1);
    }

    #[test]
    fn test_null_split_expression_is_evaluation_error() {
        let expr = Expression::parse("headers['parts']").unwrap();
        let err = Splitter::expression(expr).split(&Record::new("p")).unwrap_err();
        assert!(err.is_evaluation());
    }

    #[test]
    fn test_only_delimiters_yields_no_fragments() {
        let splitter = Splitter::delimiters(",").unwrap();
        assert!(splitter.split(&Record::new(",,,")).unwrap().is_empty());
    }

    #[test]
    fn test_from_options() {
        let expr = Expression::parse("payload").unwrap();
        assert!(Splitter::from_options(Some(","), Some(&expr))
            .unwrap_err()
            .is_configuration());
        assert_eq!(
            Splitter::from_options(None, None).unwrap().mode(),
            &SplitMode::Delimiters(",".to_string())
        );
        assert!(Splitter::delimiters("").is_err());
    }

    #[tokio::test]
    async fn test_splitter_stage_emits_array() {
        let stage = SplitterFunction::new("split", Splitter::delimiters(",").unwrap(), true);
        let record = Record::builder(b"a,b".to_vec()).content_type("text/plain").build();

        let signal = stage.process(record).await;
        let out = signal.result().unwrap();
        assert_eq!(out.payload(), &Payload::Structured(json!(["a", "b"])));
        assert_eq!(stage.metadata().records_accepted, 1);
    }
}
