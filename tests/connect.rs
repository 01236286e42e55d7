mod common;

use blecentral::api::{ConnectionState, PeripheralId, PowerState, StackError, StackEvent};
use blecentral::Error;
use common::{
    connect_controller, controller, discover, start, wait_for_state, Call, MockStack, BATTERY,
    COMMAND, EVENTS, SENSOR, SERVICE_A, SERVICE_B,
};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn connect_runs_every_step_in_order() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);

    let device = connect_controller(&manager).await?;

    let id = controller().id;
    assert_eq!(
        stack.calls(),
        vec![
            Call::StartScan,
            Call::StopScan,
            Call::Connect(id.clone()),
            Call::DiscoverServices(id),
            Call::DiscoverCharacteristics(SERVICE_A),
            Call::DiscoverCharacteristics(SERVICE_B),
        ]
    );
    assert_eq!(device.services, vec![SERVICE_A, SERVICE_B]);
    let order: Vec<_> = device.characteristics.iter().map(|c| c.uuid).collect();
    assert_eq!(order, vec![SENSOR, COMMAND, EVENTS, BATTERY]);
    assert_eq!(manager.connection_state().await?, ConnectionState::Ready);
    assert_eq!(manager.device().await?, Some(device));
    assert_eq!(manager.last_connected().await?, Some(controller()));
    Ok(())
}

#[tokio::test]
async fn observer_sees_every_connect_step() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);

    let states = manager.observe_connection_state()?;
    connect_controller(&manager).await?;
    let seen: Vec<_> = states.take(5).collect().await;
    assert_eq!(
        seen,
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::DiscoveringServices,
            ConnectionState::DiscoveringCharacteristics,
            ConnectionState::Ready,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn late_observer_gets_current_state_first() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);
    connect_controller(&manager).await?;

    let mut states = manager.observe_connection_state()?;
    assert_eq!(states.next().await, Some(ConnectionState::Ready));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn discovery_timeout_leaves_manager_disconnected() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    stack.configure(|s| s.respond_services = false);
    let manager = start(&stack, events);
    discover(&manager).await?;

    let start = Instant::now();
    let result = manager
        .connect(&controller().id, Duration::from_secs(10))
        .await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(Error::DiscoveryTimeout(t)) if t == Duration::from_secs(4)));
    assert!(elapsed >= Duration::from_secs(4));
    assert!(elapsed < Duration::from_millis(4100));
    assert_eq!(manager.connection_state().await?, ConnectionState::Disconnected);
    assert_eq!(manager.device().await?, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_is_the_callers() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    stack.configure(|s| s.respond_connect = false);
    let manager = start(&stack, events);
    discover(&manager).await?;

    let start = Instant::now();
    let result = manager
        .connect(&controller().id, Duration::from_secs(2))
        .await;
    assert!(matches!(
        result,
        Err(Error::ConnectTimeout(id, t)) if id == controller().id && t == Duration::from_secs(2)
    ));
    assert!(start.elapsed() < Duration::from_millis(2100));
    assert_eq!(manager.connection_state().await?, ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn characteristic_discovery_timeout_leaves_manager_disconnected() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    stack.configure(|s| s.respond_characteristics = false);
    let manager = start(&stack, events);
    discover(&manager).await?;
    stack.clear_calls();

    let start = Instant::now();
    let result = manager
        .connect(&controller().id, Duration::from_secs(10))
        .await;

    assert!(matches!(result, Err(Error::DiscoveryTimeout(t)) if t == Duration::from_secs(4)));
    assert!(start.elapsed() < Duration::from_millis(4100));
    // Never moves on to the second service.
    assert_eq!(
        stack.calls().last(),
        Some(&Call::DiscoverCharacteristics(SERVICE_A))
    );
    assert_eq!(manager.connection_state().await?, ConnectionState::Disconnected);
    assert_eq!(manager.device().await?, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_of_another_peripheral_keeps_waiting() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    stack.configure(|s| s.respond_connect = false);
    let manager = start(&stack, events);
    discover(&manager).await?;

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .connect(&controller().id, Duration::from_secs(10))
                .await
        })
    };
    wait_for_state(&manager, ConnectionState::Connecting).await;

    stack.emit(StackEvent::Connected(PeripheralId::from("someone-else")));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!pending.is_finished());
    assert_eq!(manager.connection_state().await?, ConnectionState::Connecting);
    assert!(!stack
        .calls()
        .iter()
        .any(|c| matches!(c, Call::DiscoverServices(_))));

    stack.emit(StackEvent::Connected(controller().id));
    let device = pending.await??;
    assert_eq!(device.id(), &controller().id);
    assert_eq!(manager.connection_state().await?, ConnectionState::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn second_connect_is_rejected_while_connecting() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    stack.configure(|s| s.respond_connect = false);
    let manager = start(&stack, events);
    discover(&manager).await?;

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .connect(&controller().id, Duration::from_secs(10))
                .await
        })
    };
    wait_for_state(&manager, ConnectionState::Connecting).await;

    let second = manager
        .connect(&controller().id, Duration::from_secs(10))
        .await;
    assert!(matches!(second, Err(Error::OperationInProgress)));
    assert_eq!(manager.connection_state().await?, ConnectionState::Connecting);

    assert!(matches!(first.await?, Err(Error::ConnectTimeout(..))));
    Ok(())
}

#[tokio::test]
async fn unknown_peripheral_is_an_invalid_target() {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);

    let missing = PeripheralId::from("never-seen");
    let result = manager.connect(&missing, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(Error::InvalidTarget(id)) if id == missing));
    assert!(stack.calls().is_empty());
}

#[tokio::test]
async fn connect_failure_is_reported() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    stack.configure(|s| s.connect_error = Some(StackError::from("peer refused")));
    let manager = start(&stack, events);
    discover(&manager).await?;

    let result = manager
        .connect(&controller().id, Duration::from_secs(10))
        .await;
    assert!(matches!(result, Err(Error::ConnectFailed(_, e)) if e.0 == "peer refused"));
    assert_eq!(manager.connection_state().await?, ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn connect_requires_power() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);
    discover(&manager).await?;
    let mut power = manager.observe_power_state();
    stack.emit(StackEvent::PowerStateChanged(PowerState::PoweredOff));
    while power.next().await != Some(PowerState::PoweredOff) {}

    let result = manager
        .connect(&controller().id, Duration::from_secs(10))
        .await;
    assert!(matches!(result, Err(Error::PoweredOff)));
    Ok(())
}

#[tokio::test]
async fn events_for_other_peripherals_are_ignored() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);
    connect_controller(&manager).await?;

    stack.emit(StackEvent::Disconnected(PeripheralId::from("someone-else")));
    assert_eq!(manager.connection_state().await?, ConnectionState::Ready);
    Ok(())
}

#[tokio::test]
async fn unsolicited_disconnect_resets_state() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);
    connect_controller(&manager).await?;

    stack.emit(StackEvent::Disconnected(controller().id));
    wait_for_state(&manager, ConnectionState::Disconnected).await;

    assert_eq!(manager.device().await?, None);
    assert!(matches!(manager.read(BATTERY).await, Err(Error::NotConnected)));
    assert_eq!(manager.last_connected().await?, Some(controller()));
    Ok(())
}

#[tokio::test]
async fn power_loss_drops_the_connection() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);
    connect_controller(&manager).await?;

    stack.emit(StackEvent::PowerStateChanged(PowerState::PoweredOff));
    wait_for_state(&manager, ConnectionState::Disconnected).await;
    assert_eq!(manager.device().await?, None);
    Ok(())
}

#[tokio::test]
async fn disconnect_tells_the_radio_and_resets() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);
    connect_controller(&manager).await?;
    stack.clear_calls();

    manager.disconnect().await?;
    assert_eq!(stack.calls(), vec![Call::Disconnect(controller().id)]);
    assert_eq!(manager.connection_state().await?, ConnectionState::Disconnected);

    // Nothing to drop the second time.
    manager.disconnect().await?;
    assert_eq!(stack.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn reconnect_after_disconnect_rediscovers() -> anyhow::Result<()> {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);
    connect_controller(&manager).await?;
    manager.disconnect().await?;

    let device = manager
        .connect(&controller().id, Duration::from_secs(10))
        .await?;
    assert_eq!(device.characteristics.len(), 4);
    assert!(device.notifying().next().is_none());
    Ok(())
}

#[tokio::test]
async fn stopped_manager_rejects_operations() {
    let (stack, events) = MockStack::new();
    let manager = start(&stack, events);

    manager.shutdown();
    assert!(matches!(
        manager.connection_state().await,
        Err(Error::ManagerStopped)
    ));
    assert!(matches!(
        manager.scan(["FE"]).await,
        Err(Error::ManagerStopped)
    ));
}
