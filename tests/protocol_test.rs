//! Worker line protocol as seen from outside the crate.

use plugcheck::engine::TestResult;
use plugcheck::supervisor::protocol::{
    decode_line, encode_line, ProtocolError, WorkerMessage, MAX_LINE_SIZE,
};

/// A transcript as a worker would write it.
fn transcript() -> String {
    let mut failed = TestResult::started("Editor");
    failed.add_failure("Editor failed to open");
    failed.finish();

    let messages = [
        WorkerMessage::Log {
            text: "Random seed: 0x2a".into(),
        },
        WorkerMessage::Log {
            text: "Starting test: Editor".into(),
        },
        WorkerMessage::item_complete(&failed),
        WorkerMessage::AllComplete {
            tests: 1,
            failures: 1,
            seed: 42,
        },
    ];
    messages
        .iter()
        .map(|m| encode_line(m).unwrap() + "\n")
        .collect()
}

#[test]
fn transcript_decodes_in_order() {
    let decoded: Vec<_> = transcript().lines().map(|l| decode_line(l).unwrap()).collect();
    assert_eq!(decoded.len(), 4);
    assert!(matches!(&decoded[0], WorkerMessage::Log { text } if text == "Random seed: 0x2a"));
    assert!(matches!(
        &decoded[2],
        WorkerMessage::ItemComplete { name, failures: 1, .. } if name == "Editor"
    ));
    assert!(decoded[3].is_terminal());
    assert!(decoded[..3].iter().all(|m| !m.is_terminal()));
}

#[test]
fn plugin_noise_is_rejected() {
    for line in ["Segmentation fault (core dumped)", "{\"kind\":", "[]", "{}"] {
        assert!(decode_line(line).is_err(), "{line}");
    }
}

#[test]
fn missing_result_flags_default_to_false() {
    let line = r#"{"kind":"item_complete","name":"Plugin info","failures":0,"result":{"name":"Plugin info","started_at":"2024-01-01T00:00:00Z","ended_at":"2024-01-01T00:00:01Z","passes":1,"failures":0,"messages":[],"output":[]}}"#;
    match decode_line(line).unwrap() {
        WorkerMessage::ItemComplete { result, .. } => {
            assert!(!result.pseudo);
            assert!(!result.incomplete);
            assert_eq!(result.duration_ms(), 1000);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn oversized_output_is_refused_on_encode() {
    let mut result = TestResult::started("Fuzz parameters");
    result.output.push("x".repeat(MAX_LINE_SIZE));
    assert!(matches!(
        encode_line(&WorkerMessage::item_complete(&result)),
        Err(ProtocolError::MessageTooLarge { .. })
    ));
}
