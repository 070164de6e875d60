use std::{sync::Arc, time::Duration};

use tcf_core::{ChannelError, ChannelManager, ChannelState, Peer, open_channel_blocking};
use tcf_test_utils::{SimChannelManager, dispatcher};

fn peer() -> Peer {
    Peer::new("TCP:127.0.0.1:1534", "target")
}

#[test]
fn test_open_channel_blocking() {
    let dispatcher = dispatcher();
    let sim = Arc::new(SimChannelManager::new(dispatcher.clone()));
    let manager: Arc<dyn ChannelManager> = sim.clone();

    let channel =
        open_channel_blocking(&dispatcher, &manager, &peer(), Duration::from_secs(5)).unwrap();
    assert_eq!(channel.remote_peer(), &peer());

    let state = {
        let channel = Arc::clone(&channel);
        dispatcher.invoke_and_wait(move || channel.state()).unwrap()
    };
    assert_eq!(state, ChannelState::Open);
    assert_eq!(sim.open_count(), 1);
}

#[test]
fn test_open_failure_is_reported() {
    let dispatcher = dispatcher();
    let sim = Arc::new(SimChannelManager::new(dispatcher.clone()));
    sim.fail_opens(Some(ChannelError::NotResponding("target".into())));
    let manager: Arc<dyn ChannelManager> = sim;

    let result = open_channel_blocking(&dispatcher, &manager, &peer(), Duration::from_secs(5));
    assert_eq!(
        result.err(),
        Some(ChannelError::NotResponding("target".into()))
    );
}

#[test]
fn test_late_channel_is_closed() {
    let dispatcher = dispatcher();
    let sim = Arc::new(SimChannelManager::new(dispatcher.clone()));
    sim.hold_opens();
    let manager: Arc<dyn ChannelManager> = sim.clone();

    let timeout = Duration::from_millis(20);
    let result = open_channel_blocking(&dispatcher, &manager, &peer(), timeout);
    assert_eq!(result.err(), Some(ChannelError::Timeout(timeout)));

    sim.release_opens();
    dispatcher.invoke_and_wait(|| ()).unwrap();
    dispatcher.invoke_and_wait(|| ()).unwrap();

    assert_eq!(sim.close_count(), 1);
    assert_eq!(sim.open_channels(), 0);
}

#[test]
fn test_rejected_on_dispatch_thread() {
    let dispatcher = dispatcher();
    let manager: Arc<dyn ChannelManager> = Arc::new(SimChannelManager::new(dispatcher.clone()));

    let d = dispatcher.clone();
    let result = dispatcher
        .invoke_and_wait(move || {
            open_channel_blocking(&d, &manager, &peer(), Duration::from_secs(1)).err()
        })
        .unwrap();
    assert_eq!(result, Some(ChannelError::OnDispatchThread));
}
