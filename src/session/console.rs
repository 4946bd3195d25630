//! Terminal front-end for the approval service: prompts the operator for each
//! pending permission or question, one at a time.

use anyhow::{Context, Result};
use dialoguer::{Input, Select, theme::ColorfulTheme};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::approval::{ApprovalEvent, ApprovalService, PendingRequest, RequestKind};

const DENIED_AT_CONSOLE: &str = "Denied by the operator";

/// A question extracted from an `AskUserQuestion` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleQuestion {
    pub question: String,
    pub options: Vec<String>,
}

/// What the operator chose for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConsoleDecision {
    Approve,
    Deny,
    Answer(BTreeMap<String, String>),
}

pub struct ConsoleResponder {
    approvals: Arc<ApprovalService>,
}

impl ConsoleResponder {
    pub fn new(approvals: Arc<ApprovalService>) -> Self {
        Self { approvals }
    }

    /// Answer requests until `shutdown` fires or the service goes away.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut events = self.approvals.subscribe();
        // requests opened before we subscribed
        for request in self.approvals.pending() {
            self.handle(request).await;
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ApprovalEvent::Requested(request)) => {
                    self.handle(request).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Console fell behind approval events");
                    for request in self.approvals.pending() {
                        self.handle(request).await;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Prompt for one request. Returns false without prompting when the
    /// request was resolved or cancelled before its turn came.
    async fn handle(&self, request: PendingRequest) -> bool {
        let id = request.id.clone();
        if !self.approvals.is_pending(&id) {
            tracing::debug!(request_id = %id, "Skipping request that is no longer pending");
            return false;
        }
        let prompt = tokio::task::spawn_blocking(move || prompt_operator(&request)).await;

        let decision = match prompt {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::warn!(request_id = %id, error = %e, "Console prompt failed; denying");
                ConsoleDecision::Deny
            }
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "Console prompt panicked; denying");
                ConsoleDecision::Deny
            }
        };

        let outcome = match decision {
            ConsoleDecision::Approve => self.approvals.approve(&id),
            ConsoleDecision::Deny => self.approvals.deny(&id, DENIED_AT_CONSOLE),
            ConsoleDecision::Answer(answers) => self.approvals.answer(&id, answers),
        };
        if let Err(e) = outcome {
            // session ended while the operator was deciding
            tracing::debug!(request_id = %id, error = %e, "Decision not delivered");
        }
        true
    }
}

fn prompt_operator(request: &PendingRequest) -> Result<ConsoleDecision> {
    println!();
    println!(
        "  {} {}",
        console::style("?").yellow().bold(),
        console::style(request.summary()).bold()
    );

    match &request.kind {
        RequestKind::Permission { .. } => {
            let options = &["Allow", "Deny"];
            let selection = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("Allow this tool use?")
                .items(options)
                .default(0)
                .interact()
                .context("Failed to read permission decision")?;
            Ok(match selection {
                0 => ConsoleDecision::Approve,
                _ => ConsoleDecision::Deny,
            })
        }
        RequestKind::Question { input } => {
            let mut answers = BTreeMap::new();
            for question in parse_questions(input) {
                let answer = if question.options.is_empty() {
                    Input::<String>::with_theme(&ColorfulTheme::default())
                        .with_prompt(&question.question)
                        .interact_text()
                        .context("Failed to read answer")?
                } else {
                    let selection = Select::with_theme(&ColorfulTheme::default())
                        .with_prompt(&question.question)
                        .items(&question.options)
                        .default(0)
                        .interact()
                        .context("Failed to read answer")?;
                    question.options[selection].clone()
                };
                answers.insert(question.question, answer);
            }
            if answers.is_empty() {
                println!("  {}", console::style("No questions found; skipping").dim());
                return Ok(ConsoleDecision::Deny);
            }
            Ok(ConsoleDecision::Answer(answers))
        }
    }
}

/// Pull the questions and their option labels out of a question payload.
pub fn parse_questions(input: &Value) -> Vec<ConsoleQuestion> {
    let Some(questions) = input.get("questions").and_then(Value::as_array) else {
        return Vec::new();
    };
    questions
        .iter()
        .filter_map(|q| {
            let question = q.get("question")?.as_str()?.to_string();
            let options = q
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| {
                            o.get("label")
                                .and_then(Value::as_str)
                                .or_else(|| o.as_str())
                                .map(str::to_string)
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(ConsoleQuestion { question, options })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_questions_with_labelled_options() {
        let input = json!({
            "questions": [
                {"question": "Which DB?", "options": [{"label": "Postgres"}, {"label": "SQLite"}]},
                {"question": "Anything else?"}
            ]
        });
        let questions = parse_questions(&input);
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].question, "Which DB?");
        assert_eq!(questions[0].options, vec!["Postgres", "SQLite"]);
        assert!(questions[1].options.is_empty());
    }

    #[test]
    fn test_parse_questions_accepts_plain_string_options() {
        let input = json!({"questions": [{"question": "Color?", "options": ["red", "blue"]}]});
        assert_eq!(parse_questions(&input)[0].options, vec!["red", "blue"]);
    }

    #[test]
    fn test_parse_questions_tolerates_bad_payloads() {
        assert!(parse_questions(&json!({})).is_empty());
        assert!(parse_questions(&json!({"questions": [{"text": "no question key"}]})).is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let approvals = Arc::new(ApprovalService::new());
        let shutdown = CancellationToken::new();
        let responder = ConsoleResponder::new(approvals);
        shutdown.cancel();
        // no pending requests, so no prompt is shown
        responder.run(shutdown).await;
    }

    #[tokio::test]
    async fn test_resolved_request_is_not_prompted() {
        let approvals = Arc::new(ApprovalService::new());
        let (request, _rx) = approvals.request_approval("S1", "Bash", json!({"command": "ls"}));
        approvals.approve(&request.id).unwrap();

        let responder = ConsoleResponder::new(approvals.clone());
        assert!(!responder.handle(request).await);
    }

    #[tokio::test]
    async fn test_cancelled_request_is_not_prompted() {
        let approvals = Arc::new(ApprovalService::new());
        let (request, _rx) = approvals.request_question("S1", json!({"questions": []}));
        approvals.cancel_for_stage("S1");

        let responder = ConsoleResponder::new(approvals.clone());
        assert!(!responder.handle(request).await);
        assert!(approvals.pending().is_empty());
    }
}
