//! Property tests for the destination set.
//!
//! Any sequence of add/remove commands leaves the orchestrator with exactly
//! the destinations a plain set would hold, and never more than one live
//! recorder per destination.

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

use rtc_relay::recording::{RecorderOptions, RecordingOrchestrator};
use rtc_relay::testing::{video_track, MockRecorderFactory};

#[derive(Debug, Clone)]
enum Op {
    Add(String),
    Remove(String),
}

fn address() -> impl Strategy<Value = String> {
    // a small pool so adds and removes collide; padding exercises trimming
    (0usize..5, any::<bool>()).prop_map(|(n, padded)| {
        let url = format!("rtmp://host{n}/live/stream");
        if padded {
            format!("  {url} ")
        } else {
            url
        }
    })
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![address().prop_map(Op::Add), address().prop_map(Op::Remove)]
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn replay_matches_a_plain_set(ops in prop::collection::vec(op(), 0..40)) {
        let factory = Arc::new(MockRecorderFactory::default());
        let mut orch = RecordingOrchestrator::new(factory, RecorderOptions::default());
        let mut model = BTreeSet::new();

        block_on(async {
            for op in &ops {
                match op {
                    Op::Add(url) => {
                        orch.add_destination(url, &[]).await.unwrap();
                        model.insert(url.trim().to_string());
                    }
                    Op::Remove(url) => {
                        orch.remove_destination(url).await.unwrap();
                        model.remove(url.trim());
                    }
                }
            }
        });

        prop_assert_eq!(orch.urls(), model.into_iter().collect::<Vec<_>>());
        prop_assert!(!orch.is_recording());
        prop_assert_eq!(orch.active_recorders(), 0);
    }

    #[test]
    fn recording_keeps_one_recorder_per_destination(
        ops in prop::collection::vec(op(), 0..40),
        restart in any::<bool>(),
    ) {
        let factory = Arc::new(MockRecorderFactory::default());
        let mut orch = RecordingOrchestrator::new(factory.clone(), RecorderOptions::default());
        let tracks = [video_track("v")];

        block_on(async {
            orch.start_recording(&tracks).await;
            orch.add_destination("rtmp://seed/live/stream", &tracks).await.unwrap();
            orch.start_recording(&tracks).await;
            for op in &ops {
                match op {
                    Op::Add(url) => {
                        orch.add_destination(url, &tracks).await.unwrap();
                    }
                    Op::Remove(url) => {
                        orch.remove_destination(url).await.unwrap();
                    }
                }
            }
            if restart {
                orch.start_recording(&tracks).await;
            }
        });

        prop_assert!(orch.is_recording());
        prop_assert_eq!(orch.active_recorders(), orch.urls().len());
        prop_assert_eq!(factory.running(), orch.urls().len());
    }
}
