mod support;

use acquisition::{ChannelStrategy, DiagnosticCode, RunRequest, StopCondition};
use chrono::{TimeZone, Utc};
use platform::{Banner, BannerKind, FetchError, Target, TimeBounds};
use support::{DriverScript, FakeLauncher, assert_unique, dom_coordinator, ids, item_ids, pools};

fn dom(rotation: bool) -> ChannelStrategy {
    ChannelStrategy::Dom {
        rotation,
        chunking: None,
    }
}

#[tokio::test(start_paused = true)]
async fn empty_query_declares_boundary_without_rotation() {
    let launcher = FakeLauncher::uniform(DriverScript::feed(Vec::new(), 5));
    let (coordinator, log) = dom_coordinator(pools(3), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::search("nothing here"), 50, dom(true)))
        .await;

    assert!(outcome.success);
    assert!(outcome.items.is_empty());
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::DomBoundary));
    assert!(log.extractions() <= 4);
    assert_eq!(log.launched().len(), 1);
    assert_eq!(outcome.sessions_used.len(), 1);
    assert_eq!(outcome.telemetry.counter("rotations"), 0);
}

#[tokio::test(start_paused = true)]
async fn date_chunks_never_rotate() {
    let launcher = FakeLauncher::uniform(DriverScript::feed(Vec::new(), 5));
    let (coordinator, log) = dom_coordinator(pools(3), launcher);

    let bounds = TimeBounds {
        since: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
        until: Some(Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()),
    };
    let request = RunRequest::new(
        Target::search("quiet topic"),
        50,
        ChannelStrategy::Dom {
            rotation: true,
            chunking: Some(7),
        },
    )
    .with_stop(StopCondition {
        bounds,
        ..StopCondition::default()
    });
    let outcome = coordinator.run(request).await;

    assert!(outcome.success);
    assert!(outcome.items.is_empty());
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::EndOfTimeline));
    assert!(log.extractions() <= 4);
    assert_eq!(outcome.sessions_used.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn chunks_share_one_dedup_set() {
    let launcher = FakeLauncher::uniform(DriverScript::feed(ids(1..=8), 4));
    let (coordinator, log) = dom_coordinator(pools(1), launcher);

    let bounds = TimeBounds {
        since: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
        until: Some(Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap()),
    };
    let request = RunRequest::new(
        Target::search("topic"),
        100,
        ChannelStrategy::Dom {
            rotation: false,
            chunking: Some(2),
        },
    )
    .with_stop(StopCondition {
        bounds,
        ..StopCondition::default()
    });
    let outcome = coordinator.run(request).await;

    assert!(outcome.success);
    assert_unique(&outcome);
    assert_eq!(outcome.items.len(), 8);
    assert!(log.extractions() > 4, "every chunk scrolls its own window");
}

#[tokio::test(start_paused = true)]
async fn stalled_timeline_rotates_and_deep_scrolls_further() {
    let launcher = FakeLauncher::default()
        .with_session("s1", DriverScript::feed(ids(1..=5), 5))
        .with_session("s2", DriverScript::feed(ids(1..=12), 5));
    let (coordinator, log) = dom_coordinator(pools(2), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::profile("someone"), 100, dom(true)))
        .await;

    assert!(outcome.success);
    assert_unique(&outcome);
    assert_eq!(outcome.items.len(), 12);
    assert_eq!(outcome.sessions_used, vec!["s1", "s2"]);
    assert_eq!(log.launched(), vec!["s1", "s2"]);
    assert_eq!(outcome.telemetry.counter("rotations"), 1);
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::DomBoundary));
}

fn rejecting(err: FetchError) -> DriverScript {
    DriverScript {
        extract_error: Some(err),
        ..DriverScript::feed(ids(1..=5), 5)
    }
}

#[tokio::test(start_paused = true)]
async fn rejected_session_is_replaced_mid_scroll() {
    let launcher = FakeLauncher::uniform(DriverScript::feed(ids(1..=6), 6))
        .with_session("s1", rejecting(FetchError::Unauthenticated("logged out".into())));
    let (coordinator, log) = dom_coordinator(pools(2), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::profile("someone"), 100, dom(true)))
        .await;

    assert!(outcome.success);
    assert_eq!(item_ids(&outcome), ids(1..=6));
    assert_eq!(outcome.sessions_used, vec!["s1", "s2"]);
    assert_eq!(log.launched(), vec!["s1", "s2"]);
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::DomBoundary));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_extraction_in_search_moves_to_fresh_session() {
    let launcher = FakeLauncher::uniform(DriverScript::feed(ids(1..=3), 3))
        .with_session("s1", rejecting(FetchError::RateLimited { retry_after: None }));
    let (coordinator, log) = dom_coordinator(pools(2), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::search("topic"), 100, dom(true)))
        .await;

    assert_eq!(item_ids(&outcome), ids(1..=3));
    assert_eq!(log.launched(), vec!["s1", "s2"]);
    assert_eq!(outcome.telemetry.counter("rotations"), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_session_without_replacement_ends_channel() {
    let launcher = FakeLauncher::uniform(rejecting(FetchError::Unauthenticated("logged out".into())));
    let (coordinator, log) = dom_coordinator(pools(1), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::profile("someone"), 100, dom(true)))
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::ErrorsExhausted));
    assert_eq!(log.launched(), vec!["s1"]);
}

#[tokio::test(start_paused = true)]
async fn rejected_session_is_not_replaced_when_rotation_is_off() {
    let launcher = FakeLauncher::uniform(DriverScript::feed(ids(1..=6), 6))
        .with_session("s1", rejecting(FetchError::Unauthenticated("logged out".into())));
    let (coordinator, log) = dom_coordinator(pools(2), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::profile("someone"), 100, dom(false)))
        .await;

    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::ErrorsExhausted));
    assert_eq!(log.launched(), vec!["s1"]);
}

#[tokio::test(start_paused = true)]
async fn fresh_identities_reaching_nothing_conclude_platform_limit() {
    let launcher = FakeLauncher::uniform(DriverScript::feed(ids(1..=5), 5));
    let (coordinator, _log) = dom_coordinator(pools(4), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::profile("someone"), 100, dom(true)))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.items.len(), 5);
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::PlatformDepthLimit));
    assert_eq!(outcome.telemetry.counter("rotations"), 2);
    assert_eq!(outcome.sessions_used.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn home_feed_never_rotates() {
    let launcher = FakeLauncher::uniform(DriverScript::feed(ids(1..=3), 3));
    let (coordinator, log) = dom_coordinator(pools(3), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::Home, 100, dom(true)))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.items.len(), 3);
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::DomBoundary));
    assert_eq!(log.launched().len(), 1);
    assert_eq!(log.extractions(), 7);
}

#[tokio::test(start_paused = true)]
async fn empty_result_state_is_end_of_timeline() {
    let launcher = FakeLauncher::uniform(DriverScript {
        empty_state: true,
        ..DriverScript::default()
    });
    let (coordinator, log) = dom_coordinator(pools(1), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::search("no such thing"), 10, dom(true)))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::EndOfTimeline));
    assert_eq!(log.extractions(), 0);
}

#[tokio::test(start_paused = true)]
async fn content_timeout_is_an_error() {
    let launcher = FakeLauncher::uniform(DriverScript {
        wait_error: Some(FetchError::Timeout("no content marker".into())),
        ..DriverScript::default()
    });
    let (coordinator, _log) = dom_coordinator(pools(1), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::profile("someone"), 10, dom(true)))
        .await;

    assert!(!outcome.success);
    assert!(outcome.retryable);
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::ErrorsExhausted));
}

#[tokio::test(start_paused = true)]
async fn banner_with_retry_affordance_recovers() {
    let launcher = FakeLauncher::uniform(DriverScript {
        banners: vec![Banner {
            kind: BannerKind::Error,
            text: "Something went wrong. Try reloading.".into(),
        }],
        retry_affordance: true,
        ..DriverScript::feed(ids(1..=10), 5)
    });
    let (coordinator, _log) = dom_coordinator(pools(1), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::search("topic"), 10, dom(true)))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.items.len(), 10);
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::TargetReached));
    assert_eq!(outcome.telemetry.counter("banner_recoveries"), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_banner_without_affordance_stops() {
    let launcher = FakeLauncher::uniform(DriverScript {
        banners: vec![Banner {
            kind: BannerKind::RateLimited,
            text: "Rate limit exceeded".into(),
        }],
        ..DriverScript::feed(ids(1..=10), 4)
    });
    let (coordinator, _log) = dom_coordinator(pools(1), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::search("topic"), 100, dom(true)))
        .await;

    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::RateLimited));
    assert_eq!(item_ids(&outcome), vec!["1", "2", "3", "4"]);
    assert!(outcome.success);
    assert!(outcome.retryable);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_scroll_keeps_partial_results() {
    let request = RunRequest::new(Target::profile("someone"), 100, dom(true));
    let launcher = FakeLauncher::uniform(DriverScript {
        cancel_on_scroll: Some((2, request.cancel_flag())),
        ..DriverScript::feed(ids(1..=100), 5)
    });
    let (coordinator, _log) = dom_coordinator(pools(1), launcher);

    let outcome = coordinator.run(request).await;

    assert!(outcome.success);
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::Cancelled));
    assert_eq!(outcome.items.len(), 10);
}

#[tokio::test(start_paused = true)]
async fn launch_failure_is_a_fatal_init_error() {
    let launcher = FakeLauncher::failing(FetchError::Transport("chromium not found".into()));
    let (coordinator, _log) = dom_coordinator(pools(1), launcher);

    let outcome = coordinator
        .run(RunRequest::new(Target::profile("someone"), 10, dom(true)))
        .await;

    assert!(!outcome.success);
    assert!(outcome.items.is_empty());
    assert_eq!(outcome.diagnostic, Some(DiagnosticCode::InitFailed));
    assert!(outcome.error.unwrap().contains("chromium not found"));
}
