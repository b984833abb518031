//! Integration tests for the shared budget ledger.

use std::sync::Arc;
use std::thread;

use rlm_core::{BudgetLedger, ModelPricing};

#[test]
fn test_concurrent_usage_is_never_lost() {
    const THREADS: u64 = 16;
    const CALLS: u64 = 100;

    let ledger = Arc::new(BudgetLedger::new(1_000.0));
    ledger.register_model(
        "model-a",
        ModelPricing {
            input_per_1m: 2.0,
            output_per_1m: 8.0,
        },
    );

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                for _ in 0..CALLS {
                    ledger.add_usage(1_000, 500, Some("model-a"));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = ledger.snapshot();
    assert_eq!(snapshot.total_input_tokens, THREADS * CALLS * 1_000);
    assert_eq!(snapshot.total_output_tokens, THREADS * CALLS * 500);
    // 1 000 input at $2/M plus 500 output at $8/M is $0.006 per call.
    let expected = (THREADS * CALLS) as f64 * 0.006;
    assert!((snapshot.current_cost - expected).abs() < 1e-9);
    assert!((ledger.model_stats("model-a").unwrap().cost - expected).abs() < 1e-9);
}

#[test]
fn test_check_fails_once_ceiling_is_reached() {
    let ledger = BudgetLedger::new(0.01);
    ledger.register_model(
        "m",
        ModelPricing {
            input_per_1m: 10_000.0,
            output_per_1m: 0.0,
        },
    );
    assert!(ledger.check().is_ok());
    ledger.add_usage(1, 0, Some("m"));
    let err = ledger.check().unwrap_err();
    assert_eq!(err.limit, 0.01);
    assert!(err.current >= 0.01);
}
