//! Line protocol between a worker process and its supervisor.
//!
//! One JSON object per line, tagged by `kind`. Every line doubles as a
//! heartbeat; there is no separate keep-alive message.
//!
//! ```text
//! {"kind":"log","text":"Starting test: Plugin info"}
//! {"kind":"item_complete","name":"Plugin info","failures":0,"result":{...}}
//! {"kind":"all_complete","tests":10,"failures":0,"seed":4660}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::TestResult;

/// Maximum encoded line length, newline excluded.
pub const MAX_LINE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    Log {
        text: String,
    },
    ItemComplete {
        name: String,
        failures: u32,
        result: TestResult,
    },
    AllComplete {
        tests: u32,
        failures: u32,
        seed: u64,
    },
}

impl WorkerMessage {
    pub fn item_complete(result: &TestResult) -> Self {
        Self::ItemComplete {
            name: result.name.clone(),
            failures: result.failures,
            result: result.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AllComplete { .. })
    }
}

/// Encode a message as one line, without the trailing newline.
pub fn encode_line(message: &WorkerMessage) -> Result<String, ProtocolError> {
    let line = serde_json::to_string(message)?;
    if line.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: line.len(),
            max: MAX_LINE_SIZE,
        });
    }
    Ok(line)
}

/// Encode a test result, dropping trailing `output` lines when the full
/// result would not fit in one line. Failure messages are always kept; a
/// result whose messages alone are too large is an error.
pub fn encode_item_complete(result: &TestResult) -> Result<String, ProtocolError> {
    match encode_line(&WorkerMessage::item_complete(result)) {
        Err(ProtocolError::MessageTooLarge { .. }) => {
            encode_line(&WorkerMessage::item_complete(&truncate_output(result)?))
        }
        other => other,
    }
}

fn truncation_note(dropped: usize) -> String {
    format!("[{dropped} output lines truncated]")
}

fn truncate_output(result: &TestResult) -> Result<TestResult, ProtocolError> {
    let mut trimmed = result.clone();
    // The note for the full count is the longest one we can emit.
    trimmed.output = vec![truncation_note(result.output.len())];
    let base = serde_json::to_string(&WorkerMessage::item_complete(&trimmed))?.len();
    let mut budget = MAX_LINE_SIZE.saturating_sub(base);

    let mut kept = 0;
    for line in &result.output {
        // Quoted line plus its separating comma.
        let cost = serde_json::to_string(line)?.len() + 1;
        if cost > budget {
            break;
        }
        budget -= cost;
        kept += 1;
    }

    trimmed.output = result.output[..kept].to_vec();
    trimmed.output.push(truncation_note(result.output.len() - kept));
    Ok(trimmed)
}

/// Decode one line. Trailing `\r`/`\n` are ignored.
pub fn decode_line(line: &str) -> Result<WorkerMessage, ProtocolError> {
    // Check size before parsing.
    if line.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: line.len(),
            max: MAX_LINE_SIZE,
        });
    }
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Err(ProtocolError::InvalidFormat("empty line".into()));
    }
    Ok(serde_json::from_str(line)?)
}
