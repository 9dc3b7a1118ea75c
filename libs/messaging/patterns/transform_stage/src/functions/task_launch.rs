//! Builds task-launch request records.
//!
//! Each incoming record becomes a JSON request of the form
//! `{"name": ..., "args": [...], "deploymentProps": {...}}` that a task
//! launcher downstream can act on. Static arguments come first, followed by
//! one `key=value` argument per configured argument expression.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::metadata::StageCounters;
use crate::record::{CONTENT_TYPE, DEFAULT_CONTENT_TYPE};
use crate::{CompletionSignal, Expression, Record, Stage, StageError, StageMetadata, TargetSpec};

/// `[stages.<name>]` options for `type = "task_launch"`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskLaunchConfig {
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub task_name: Option<String>,
    pub task_name_expression: Option<Expression>,
    /// Arguments passed verbatim on every launch
    pub args: Vec<String>,
    /// `key=expression` pairs, comma separated
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub arg_expressions: Option<String>,
    /// `key=value` pairs, comma separated
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub deployment_properties: Option<String>,
}

impl TaskLaunchConfig {
    pub fn validate(&self) -> Result<(), StageError> {
        self.build("validate", true).map(|_| ())
    }

    pub fn build(&self, name: &str, decode_text: bool) -> Result<TaskLaunchRequestFunction, StageError> {
        let task_name = TargetSpec::from_options(
            "task_name",
            self.task_name.as_deref(),
            self.task_name_expression.as_ref(),
        )?;

        let arg_expressions = match &self.arg_expressions {
            Some(raw) => parse_key_value_pairs(raw)?
                .into_iter()
                .map(|(key, source)| Ok((key, Expression::parse(&source)?)))
                .collect::<Result<Vec<_>, StageError>>()?,
            None => Vec::new(),
        };

        let deployment_properties = match &self.deployment_properties {
            Some(raw) => parse_key_value_pairs(raw)?.into_iter().collect(),
            None => BTreeMap::new(),
        };

        Ok(TaskLaunchRequestFunction {
            name: name.to_string(),
            task_name,
            args: self.args.clone(),
            arg_expressions,
            deployment_properties,
            decode_text,
            counters: StageCounters::new(),
        })
    }
}

/// Parse `k1=v1,k2=v2`. A segment without `=` continues the previous value,
/// so values may themselves contain commas.
pub fn parse_key_value_pairs(raw: &str) -> Result<Vec<(String, String)>, StageError> {
    let mut pairs: Vec<(String, String)> = Vec::new();

    for segment in raw.split(',') {
        match segment.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !key.contains('(') => {
                pairs.push((key.trim().to_string(), value.trim().to_string()));
            }
            _ => match pairs.last_mut() {
                Some((_, value)) => {
                    value.push(',');
                    value.push_str(segment);
                }
                None if segment.trim().is_empty() => {}
                None => {
                    return Err(StageError::configuration(format!(
                        "invalid key=value list '{}': '{}' has no key",
                        raw, segment
                    )))
                }
            },
        }
    }

    for (_, value) in pairs.iter_mut() {
        *value = value.trim().to_string();
    }
    Ok(pairs)
}

#[derive(Debug)]
pub struct TaskLaunchRequestFunction {
    name: String,
    task_name: TargetSpec,
    args: Vec<String>,
    arg_expressions: Vec<(String, Expression)>,
    deployment_properties: BTreeMap<String, String>,
    decode_text: bool,
    counters: StageCounters,
}

impl TaskLaunchRequestFunction {
    fn request(&self, record: Record) -> Result<Record, StageError> {
        let record = if self.decode_text {
            record.decode_text()
        } else {
            record
        };

        let task_name = self.task_name.resolve(&record)?;
        if task_name.trim().is_empty() {
            return Err(StageError::evaluation(
                self.task_name.to_string(),
                "task name is blank",
            ));
        }

        let mut args = self.args.clone();
        for (key, expr) in &self.arg_expressions {
            let value = match expr.evaluate(&record)? {
                Value::String(s) => s,
                other => other.to_string(),
            };
            args.push(format!("{}={}", key, value));
        }

        let request = json!({
            "name": task_name,
            "args": args,
            "deploymentProps": self.deployment_properties,
        });

        Ok(Record::builder(request)
            .headers(record.headers().clone())
            .header(CONTENT_TYPE, DEFAULT_CONTENT_TYPE)
            .build())
    }
}

#[async_trait]
impl Stage for TaskLaunchRequestFunction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, record: Record) -> CompletionSignal {
        let signal = match self.request(record) {
            Ok(out) => CompletionSignal::AcceptedWith(out),
            Err(err) => CompletionSignal::Rejected(err),
        };
        self.counters.observe(&signal);
        signal
    }

    fn metadata(&self) -> StageMetadata {
        self.counters.fill(
            StageMetadata::new(&self.name, "task_launch").with_target(self.task_name.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Payload;

    #[test]
    fn test_parse_key_value_pairs() {
        let pairs = parse_key_value_pairs("a=1, b = two,c=x,y").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string()),
                ("c".to_string(), "x,y".to_string()),
            ]
        );

        assert!(parse_key_value_pairs("").unwrap().is_empty());
        assert!(parse_key_value_pairs("novalue").unwrap_err().is_configuration());
    }

    #[test]
    fn test_arg_expression_with_commas() {
        let pairs = parse_key_value_pairs("first=payload.split(',')[0],upper=payload.toUpperCase()").unwrap();
        assert_eq!(pairs[0].1, "payload.split(',')[0]");
        assert_eq!(pairs[1].1, "payload.toUpperCase()");
    }

    #[test]
    fn test_task_name_required() {
        let err = TaskLaunchConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("task_name"));
    }

    #[tokio::test]
    async fn test_launch_request_payload() {
        let config = TaskLaunchConfig {
            task_name: Some("timestamp-task".to_string()),
            args: vec!["--verbose".to_string()],
            arg_expressions: Some("first=payload.split(',')[0],id=headers['id']".to_string()),
            deployment_properties: Some("app.memory=2g,count=3".to_string()),
            ..Default::default()
        };
        let stage = config.build("launch", true).unwrap();

        let record = Record::builder("a,b").header("id", 7).build();
        let out = stage.process(record).await.into_result().unwrap().unwrap();

        assert_eq!(
            out.payload(),
            &Payload::Structured(json!({
                "name": "timestamp-task",
                "args": ["--verbose", "first=a", "id=7"],
                "deploymentProps": {"app.memory": "2g", "count": "3"},
            }))
        );
        assert_eq!(out.content_type(), "application/json");
    }

    #[tokio::test]
    async fn test_task_name_expression() {
        let config = TaskLaunchConfig {
            task_name_expression: Some(Expression::parse("headers['task']").unwrap()),
            ..Default::default()
        };
        let stage = config.build("launch", true).unwrap();

        let out = stage
            .process(Record::builder("x").header("task", "ingest").build())
            .await;
        assert_eq!(out.result().unwrap().payload().to_value()["name"], "ingest");

        let missing = stage.process(Record::new("x")).await;
        assert!(missing.error().unwrap().is_evaluation());

        let blank = stage
            .process(Record::builder("x").header("task", " ").build())
            .await;
        assert!(blank.error().unwrap().to_string().contains("blank"));
    }
}
