//! Property-based tests for the line framer and URC classifier.

use gsmgate_core::AtTimeouts;
use gsmgate_core::modem::framer::{Framer, FramerOutput};
use gsmgate_core::modem::urc::Notification;
use proptest::prelude::*;
use tokio::time::Instant;

/// Response body lines: anything printable that is not a terminator and
/// does not look like the probe echo.
fn body_line() -> impl Strategy<Value = String> {
    "[+A-Z0-9:, \"]{1,24}".prop_filter("not a terminator or probe echo", |l| {
        let l = l.trim();
        !l.is_empty() && l != "OK" && l != "ERROR" && l != "AT"
    })
}

fn run(framer: &mut Framer, lines: &[String], now: Instant) -> Vec<FramerOutput> {
    lines
        .iter()
        .flat_map(|l| framer.on_line(l.as_bytes(), now))
        .collect()
}

fn only_result(outputs: Vec<FramerOutput>) -> Vec<String> {
    let results: Vec<Vec<String>> = outputs
        .into_iter()
        .filter_map(|o| match o {
            FramerOutput::Completed(r) => Some(r.lines().to_vec()),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 1);
    results.into_iter().next().unwrap_or_default()
}

// ─── Probe recovery ─────────────────────────────────────────────────────────

proptest! {
    /// A response whose terminator is only proven by the probe frames to the
    /// same result as one read in time.
    #[test]
    fn probe_recovery_matches_in_time_result(body in prop::collection::vec(body_line(), 0..6)) {
        let command = "AT+TEST".to_string();
        let t0 = Instant::now();

        let mut in_time = Framer::new(AtTimeouts::default(), t0);
        in_time.begin(&command, t0);
        let mut lines = vec![command.clone()];
        lines.extend(body.iter().cloned());
        lines.push("OK".into());
        let expected = only_result(run(&mut in_time, &lines, t0));

        let mut probed = Framer::new(AtTimeouts::default(), t0);
        probed.begin(&command, t0);
        let mut lines = vec![command.clone(), String::new()];
        lines.extend(body.iter().cloned());
        prop_assert!(run(&mut probed, &lines, t0).is_empty());

        let t1 = probed.deadline().unwrap();
        let probe = probed.on_quiet(t1);
        prop_assert!(matches!(&probe[..], [FramerOutput::SendProbe]));
        let recovered = only_result(run(&mut probed, &["AT".to_string(), "OK".to_string()], t1));

        prop_assert_eq!(recovered, expected);
        prop_assert!(!probed.is_busy());
    }

    /// Lines arriving with nothing outstanding always surface as
    /// notifications, one per non-empty line.
    #[test]
    fn idle_lines_are_notifications(lines in prop::collection::vec(body_line(), 1..8)) {
        let now = Instant::now();
        let mut framer = Framer::new(AtTimeouts::default(), now);
        let outputs = run(&mut framer, &lines, now);
        prop_assert_eq!(outputs.len(), lines.len());
        for (out, line) in outputs.iter().zip(&lines) {
            match out {
                FramerOutput::Notification(n) => prop_assert_eq!(n, line.trim()),
                other => prop_assert!(false, "unexpected output {:?}", other),
            }
        }
    }

    /// Classification never fails; unknown lines are kept verbatim.
    #[test]
    fn classify_is_total(line in "\\PC{0,40}") {
        let n = Notification::classify(&line);
        if let Notification::Unknown(text) = &n {
            prop_assert_eq!(text, &line);
        }
    }
}
