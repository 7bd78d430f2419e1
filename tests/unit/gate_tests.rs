/// Authentication gate from the outside
use game_rpcd::gate::secrets_match;
use game_rpcd::{AuthGate, AuthOutcome, Router, RouterConfig};
use std::sync::Arc;

fn gate(secret: &str) -> Arc<AuthGate> {
    Arc::new(AuthGate::new(
        secret,
        Arc::new(Router::new(RouterConfig::default())),
    ))
}

#[test]
fn test_secret_comparison() {
    assert!(secrets_match("abc", "abc"));
    assert!(!secrets_match("abd", "abc"));
    assert!(!secrets_match("abc", "abcd"));
    assert!(!secrets_match("", "abc"));
}

#[test]
fn test_only_one_thread_opens_the_gate() {
    let gate = gate("correct horse");

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let gate = gate.clone();
            std::thread::spawn(move || {
                if i % 4 == 0 {
                    gate.try_authenticate("wrong")
                } else {
                    gate.try_authenticate("correct horse")
                }
            })
        })
        .collect();

    let outcomes: Vec<AuthOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let firsts = outcomes
        .iter()
        .filter(|o| **o == AuthOutcome::Accepted { first: true })
        .count();
    let rejected = outcomes
        .iter()
        .filter(|o| **o == AuthOutcome::Rejected)
        .count();

    assert_eq!(firsts, 1);
    assert_eq!(rejected, 4);
    assert!(gate.is_authenticated());
}

#[test]
fn test_rejection_leaves_gate_closed() {
    let gate = gate("s3cret");
    assert_eq!(gate.try_authenticate("nope"), AuthOutcome::Rejected);
    assert!(!gate.is_authenticated());
    assert_eq!(
        gate.try_authenticate("s3cret"),
        AuthOutcome::Accepted { first: true }
    );
    assert_eq!(
        gate.try_authenticate("s3cret"),
        AuthOutcome::Accepted { first: false }
    );
}
