use std::time::Duration;

use super::*;

fn policy(auto_reconnect: bool) -> ReconnectPolicy {
    ReconnectPolicy {
        auto_reconnect,
        reconnect_delay: Duration::from_millis(500),
        retry_delay: Duration::from_secs(5),
    }
}

/// Run a sequence of events from `start`, returning the final state and
/// every command issued along the way.
fn run(start: LinkState, events: &[LinkEvent], policy: &ReconnectPolicy) -> (LinkState, Vec<LinkCommand>) {
    events.iter().fold((start, Vec::new()), |(state, mut commands), event| {
        let transition = state.step(*event, policy);
        commands.extend(transition.commands);
        (transition.next, commands)
    })
}

#[test]
fn first_connect_starts_keepalive_and_reports_connected() {
    let (state, commands) = run(
        LinkState::Idle,
        &[LinkEvent::Start, LinkEvent::ConnectSucceeded],
        &policy(true),
    );
    assert_eq!(state, LinkState::Connected);
    assert_eq!(
        commands,
        [
            LinkCommand::OpenSocket,
            LinkCommand::StartKeepalive,
            LinkCommand::NotifyStatus { connected: true, hopeless: false },
        ]
    );
}

#[test]
fn failed_first_connect_retries_after_retry_delay() {
    let (state, commands) = run(
        LinkState::Connecting,
        &[LinkEvent::ConnectFailed, LinkEvent::RetryElapsed],
        &policy(true),
    );
    assert_eq!(state, LinkState::Connecting);
    assert_eq!(
        commands,
        [LinkCommand::ScheduleRetry(Duration::from_secs(5)), LinkCommand::OpenSocket]
    );
}

#[test]
fn unexpected_close_reconnects_and_resyncs() {
    let (state, commands) = run(
        LinkState::Connected,
        &[
            LinkEvent::UnexpectedClose,
            LinkEvent::RetryElapsed,
            LinkEvent::ConnectSucceeded,
            LinkEvent::ResyncFinished { accepted: true },
        ],
        &policy(true),
    );
    assert_eq!(state, LinkState::Connected);
    assert_eq!(
        commands,
        [
            LinkCommand::StopKeepalive,
            LinkCommand::NotifyStatus { connected: false, hopeless: false },
            LinkCommand::ScheduleRetry(Duration::from_millis(500)),
            LinkCommand::OpenSocket,
            LinkCommand::StartKeepalive,
            LinkCommand::Resync,
            LinkCommand::NotifyStatus { connected: true, hopeless: false },
        ]
    );
}

#[test]
fn failed_reconnect_keeps_retrying() {
    let (state, commands) = run(
        LinkState::Reconnecting,
        &[
            LinkEvent::ConnectFailed,
            LinkEvent::RetryElapsed,
            LinkEvent::ConnectFailed,
        ],
        &policy(true),
    );
    assert_eq!(state, LinkState::Reconnecting);
    assert_eq!(
        commands,
        [
            LinkCommand::ScheduleRetry(Duration::from_secs(5)),
            LinkCommand::OpenSocket,
            LinkCommand::ScheduleRetry(Duration::from_secs(5)),
        ]
    );
}

#[test]
fn rejected_resync_is_hopeless_and_asks_for_reload() {
    let (state, commands) = run(
        LinkState::Resyncing,
        &[LinkEvent::ResyncFinished { accepted: false }],
        &policy(true),
    );
    assert_eq!(state, LinkState::Disconnected { hopeless: true });
    assert!(state.is_terminal());
    assert!(commands.contains(&LinkCommand::ShowReloadNotice));
    assert!(commands.contains(&LinkCommand::NotifyStatus { connected: false, hopeless: false }));
}

#[test]
fn close_during_resync_starts_over() {
    let (state, _) = run(LinkState::Resyncing, &[LinkEvent::UnexpectedClose], &policy(true));
    assert_eq!(state, LinkState::Disconnected { hopeless: false });
}

#[test]
fn without_auto_reconnect_a_close_is_final() {
    let (state, commands) = run(
        LinkState::Connected,
        &[LinkEvent::UnexpectedClose, LinkEvent::RetryElapsed],
        &policy(false),
    );
    assert_eq!(state, LinkState::Disconnected { hopeless: true });
    assert_eq!(
        commands,
        [
            LinkCommand::StopKeepalive,
            LinkCommand::NotifyStatus { connected: false, hopeless: false },
            LinkCommand::NotifyStatus { connected: false, hopeless: true },
        ]
    );
}

#[test]
fn kill_wins_from_any_state_and_is_final() {
    for state in [
        LinkState::Idle,
        LinkState::Connecting,
        LinkState::Connected,
        LinkState::Disconnected { hopeless: false },
        LinkState::Reconnecting,
        LinkState::Resyncing,
    ] {
        let transition = state.step(LinkEvent::Kill, &policy(true));
        assert_eq!(transition.next, LinkState::Killed, "from {state:?}");
        assert_eq!(transition.commands, [LinkCommand::StopKeepalive, LinkCommand::CloseSocket]);
    }

    let after = LinkState::Killed.step(LinkEvent::ConnectSucceeded, &policy(true));
    assert_eq!(after.next, LinkState::Killed);
    assert!(after.commands.is_empty());
}

#[test]
fn stale_events_are_ignored() {
    let transition = LinkState::Connected.step(LinkEvent::ConnectFailed, &policy(true));
    assert_eq!(transition.next, LinkState::Connected);
    assert!(transition.commands.is_empty());

    let transition = LinkState::Connected.step(LinkEvent::RetryElapsed, &policy(true));
    assert_eq!(transition.next, LinkState::Connected);
    assert!(transition.commands.is_empty());
}

#[test]
fn late_resync_result_after_close_is_ignored() {
    let (state, commands) = run(
        LinkState::Resyncing,
        &[LinkEvent::UnexpectedClose, LinkEvent::ResyncFinished { accepted: true }],
        &policy(true),
    );
    assert_eq!(state, LinkState::Disconnected { hopeless: false });
    assert!(commands.contains(&LinkCommand::ScheduleRetry(Duration::from_millis(500))));
    assert!(!commands.contains(&LinkCommand::NotifyStatus {
        connected: true,
        hopeless: false
    }));
}
