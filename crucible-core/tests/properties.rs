//! Property tests for the session and pool invariants.

mod common;

use common::*;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use crucible_core::{Error, InferencePool, Session, SessionParams};

fn tight_params() -> SessionParams {
    SessionParams {
        seed: 7,
        n_threads: 1,
        n_ctx: 32,
        n_ctx_window_top_bar: 4,
        n_batch: 4,
        scroll_keep: 1.0,
        top_k: 1,
        top_p: 1.0,
        temp: 1.0,
        ..Default::default()
    }
}

fn open_session(params: SessionParams) -> Session {
    let dir = scratch_dir("prop");
    let model = mock_model_file(&dir);
    let registry = registry_with(MockBackend::new());
    Session::open_with(&registry, &model, params).expect("open mock session")
}

#[derive(Debug, Clone)]
enum Op {
    Append(String),
    Run(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        "[ -~]{1,40}".prop_map(Op::Append),
        (1usize..16).prop_map(Op::Run),
    ]
}

proptest! {
    /// I1: the context never exceeds the window, whatever the call sequence.
    #[test]
    fn prop_context_bounded(ops in proptest::collection::vec(arb_op(), 1..12)) {
        let params = tight_params();
        let n_ctx = params.n_ctx as usize;
        let mut session = open_session(params);
        for op in ops {
            match op {
                Op::Append(text) => {
                    session.append_text(&text).unwrap();
                }
                Op::Run(budget) => {
                    match session.run("", |_| true, budget_ticks(budget)) {
                        Ok(_) => {}
                        // run before the first append is the only legal failure
                        Err(Error::InvalidArgument(_)) => {}
                        Err(other) => return Err(TestCaseError::fail(other.to_string())),
                    }
                }
            }
            prop_assert!(session.context_size() <= n_ctx);
        }
    }

    /// Serialize then deserialize reproduces prompt, tokens and the greedy
    /// continuation.
    #[test]
    fn prop_serialize_roundtrip(texts in proptest::collection::vec("[ -~]{1,24}", 1..4)) {
        let dir = scratch_dir("prop-ser");
        let model = mock_model_file(&dir);
        let registry = registry_with(MockBackend::new());

        let mut original =
            Session::open_with(&registry, &model, tight_params()).unwrap();
        for text in &texts {
            original.append_text(text).unwrap();
        }
        let mut buffer = Vec::new();
        original.serialize(&mut buffer).unwrap();

        let mut restored =
            Session::open_with(&registry, &model, tight_params()).unwrap();
        restored.deserialize(&mut buffer.as_slice()).unwrap();

        prop_assert_eq!(restored.prompt(), original.prompt());
        prop_assert_eq!(restored.context_size(), original.context_size());

        let a = original.run("", |_| true, budget_ticks(4)).unwrap();
        let b = restored.run("", |_| true, budget_ticks(4)).unwrap();
        prop_assert_eq!(a, b);
    }

    /// A cancelled append never loses or re-evaluates work: after resuming,
    /// the backend has seen each prompt token exactly once. Lengths stay
    /// within the window, since scrolling re-feeds by design.
    #[test]
    fn prop_cancellation_feeds_each_token_once(
        len in 1usize..=32,
        cancel_after in 0usize..6,
    ) {
        let backend = MockBackend::new();
        let fed = backend.fed.clone();
        let dir = scratch_dir("prop-cancel");
        let model = mock_model_file(&dir);
        let registry = registry_with(backend);
        let mut session =
            Session::open_with(&registry, &model, tight_params()).unwrap();

        let text = ascii_prompt(len);
        let mut ticks = 0usize;
        session
            .append(&text, |_| {
                let go = ticks != cancel_after;
                ticks += 1;
                go
            })
            .unwrap();
        if session.context_size() < len {
            session.append_text("").unwrap();
        }

        prop_assert_eq!(fed.load(std::sync::atomic::Ordering::SeqCst), 4 + len);
        prop_assert_eq!(session.context_size(), len);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// At most N sessions are resident, and everything created stays
    /// recoverable.
    #[test]
    fn prop_pool_residency_bounded(ids in proptest::collection::vec(1u64..6, 1..12)) {
        ensure_global_mock();
        let dir = scratch_dir("prop-pool");
        let model = mock_model_file(&dir);
        let mut pool = InferencePool::with_directory(&dir, 2, "prop", true).unwrap();

        for &id in &ids {
            pool.get_or_create(id, &model, tight_params()).unwrap();
            prop_assert!(pool.active_ids().len() <= 2);
        }
        for &id in &ids {
            prop_assert!(pool.get(id).is_ok());
        }
    }

    /// Accessing K > N distinct ids in order leaves the last N resident.
    #[test]
    fn prop_pool_eviction_is_lru(extra in 1u64..4) {
        ensure_global_mock();
        let dir = scratch_dir("prop-lru");
        let model = mock_model_file(&dir);
        let mut pool = InferencePool::with_directory(&dir, 2, "lru", true).unwrap();

        let count = 2 + extra;
        for id in 1..=count {
            pool.create(id, &model, tight_params()).unwrap();
        }
        let mut active = pool.active_ids();
        active.sort_unstable();
        prop_assert_eq!(active, vec![count - 1, count]);
    }
}
