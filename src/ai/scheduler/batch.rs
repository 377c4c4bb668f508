//! Combined calls: several background requests answered by one completion.
//!
//! Each request is labelled `r1..rN` inside one prompt and the model is asked
//! for a JSON object mapping those labels to answers.

use std::collections::HashMap;

use crate::ai::json_repair::{extract_object, value_text};
use crate::types::{AiRequest, ContentPart, Payload, Role};

const COMBINED_INSTRUCTIONS: &str = "You will receive several independent requests, each introduced by a line \
\"### Request <label>\". Answer every request on its own, exactly as if it had been sent alone. \
Respond with a single JSON object mapping each label to the complete text of its answer. \
Do not add any text outside the JSON object.";

/// How a combined response covered the requests it carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CombinedOutcome {
    /// Every request has an answer
    Complete(HashMap<usize, String>),
    /// Some requests have answers; the indices listed are missing
    Partial {
        answers: HashMap<usize, String>,
        missing: Vec<usize>,
    },
    /// The call produced no text
    Empty,
    /// Text came back but no usable keyed answers could be read from it
    Malformed,
}

impl CombinedOutcome {
    /// Answers by request index, and the indices that need an individual call
    pub fn into_parts(self, count: usize) -> (HashMap<usize, String>, Vec<usize>) {
        match self {
            Self::Complete(answers) => (answers, Vec::new()),
            Self::Partial { answers, missing } => (answers, missing),
            Self::Empty | Self::Malformed => (HashMap::new(), (0..count).collect()),
        }
    }
}

/// Whether a payload can be embedded in a combined prompt
pub fn supports_shape(request: &AiRequest) -> bool {
    match &request.payload {
        Payload::Text(_) => true,
        Payload::Parts(parts) => parts.iter().all(|p| p.role != Role::Assistant),
    }
}

fn label(index: usize) -> String {
    format!("r{}", index + 1)
}

/// One payload carrying every request
pub fn build_combined(requests: &[&AiRequest]) -> Payload {
    let mut body = String::new();
    for (index, request) in requests.iter().enumerate() {
        body.push_str(&format!("### Request {}\n", label(index)));
        match &request.payload {
            Payload::Text(text) => body.push_str(text.trim_end()),
            Payload::Parts(parts) => {
                for part in parts {
                    let role = match part.role {
                        Role::System => "Instructions",
                        Role::User => "Input",
                        Role::Assistant => "Previous answer",
                    };
                    body.push_str(&format!("{}:\n{}\n", role, part.text.trim_end()));
                }
            }
        }
        body.push_str("\n\n");
    }

    Payload::Parts(vec![
        ContentPart::system(COMBINED_INSTRUCTIONS),
        ContentPart::user(body.trim_end()),
    ])
}

/// Classify a combined response for `count` requests
pub fn parse_combined(text: &str, count: usize) -> CombinedOutcome {
    if text.trim().is_empty() {
        return CombinedOutcome::Empty;
    }
    let Some(map) = extract_object(text) else {
        return CombinedOutcome::Malformed;
    };

    let mut answers = HashMap::new();
    let mut missing = Vec::new();
    for index in 0..count {
        match map.get(&label(index)).and_then(value_text) {
            Some(answer) => {
                answers.insert(index, answer);
            }
            None => missing.push(index),
        }
    }

    if answers.is_empty() {
        CombinedOutcome::Malformed
    } else if missing.is_empty() {
        CombinedOutcome::Complete(answers)
    } else {
        CombinedOutcome::Partial { answers, missing }
    }
}
