use color_eyre::Result;
use pretty_assertions::assert_eq;
use sensor_bridge::hub::{Envelope, Status, SystemStatus};
use serde_json::json;

mod common;

#[tokio::test]
async fn can_connect() -> Result<()> {
    let bridge = common::start_without_device().await?;
    common::connect(&bridge).await?;

    Ok(())
}

#[tokio::test]
async fn greeted_with_connection_count() -> Result<()> {
    let bridge = common::start_without_device().await?;

    let mut first = common::connect(&bridge).await?;
    assert_eq!(
        common::receive(&mut first).await?,
        Envelope::SystemStatus(SystemStatus::connected(1))
    );

    let mut second = common::connect(&bridge).await?;
    assert_eq!(
        common::receive(&mut second).await?,
        Envelope::SystemStatus(SystemStatus::connected(2))
    );

    Ok(())
}

#[tokio::test]
async fn readings_flow_to_subscribers() -> Result<()> {
    let bridge = common::start_with_device().await?;
    let mut client = common::connect(&bridge).await?;

    let update = common::receive_until(&mut client, |envelope| {
        matches!(envelope, Envelope::SensorUpdate(_))
    })
    .await?;

    let Envelope::SensorUpdate(frame) = update else {
        unreachable!()
    };
    assert!(frame.conteggio >= 1);

    // Later readings keep coming, in order.
    let next = common::receive_until(&mut client, |envelope| {
        matches!(envelope, Envelope::SensorUpdate(_))
    })
    .await?;
    let Envelope::SensorUpdate(next) = next else {
        unreachable!()
    };
    assert!(next.conteggio > frame.conteggio);

    Ok(())
}

#[tokio::test]
async fn late_subscriber_gets_last_reading_and_status() -> Result<()> {
    let bridge = common::start_with_device().await?;

    let mut early = common::connect(&bridge).await?;
    common::receive_until(&mut early, |envelope| {
        matches!(envelope, Envelope::SensorUpdate(_))
    })
    .await?;

    let mut late = common::connect(&bridge).await?;

    assert!(matches!(
        common::receive(&mut late).await?,
        Envelope::SensorUpdate(_)
    ));
    assert_eq!(
        common::receive(&mut late).await?,
        Envelope::SystemStatus(SystemStatus::device(Status::Ready))
    );
    assert_eq!(
        common::receive(&mut late).await?,
        Envelope::SystemStatus(SystemStatus::connected(2))
    );

    Ok(())
}

#[tokio::test]
async fn test_message_is_echoed() -> Result<()> {
    let bridge = common::start_without_device().await?;
    let mut client = common::connect(&bridge).await?;
    common::receive(&mut client).await?;

    common::send(
        &mut client,
        json!({"topic": "test_message", "payload": {"hello": "bridge"}}).to_string(),
    )
    .await?;

    match common::receive(&mut client).await? {
        Envelope::TestResponse(response) => {
            assert_eq!(response.status, "success");
            assert_eq!(response.received, json!({"hello": "bridge"}));
        }
        other => panic!("Expected a test response, got {other}"),
    }

    Ok(())
}

#[tokio::test]
async fn garbage_requests_are_ignored() -> Result<()> {
    let bridge = common::start_without_device().await?;
    let mut client = common::connect(&bridge).await?;
    common::receive(&mut client).await?;

    common::send(&mut client, "hi".into()).await?;
    common::send(
        &mut client,
        json!({"topic": "test_message", "payload": 1}).to_string(),
    )
    .await?;

    // The connection survived the garbage.
    assert!(matches!(
        common::receive(&mut client).await?,
        Envelope::TestResponse(_)
    ));

    Ok(())
}

#[tokio::test]
async fn closing_unregisters() -> Result<()> {
    let bridge = common::start_without_device().await?;

    let mut staying = common::connect(&bridge).await?;
    common::receive(&mut staying).await?;

    let mut leaving = common::connect(&bridge).await?;
    common::receive(&mut leaving).await?;
    assert_eq!(bridge.hub.subscriber_count().await, 2);

    leaving.close(None).await?;

    let hub = bridge.hub.clone();
    common::eventually(|| {
        let hub = hub.clone();
        async move { hub.subscriber_count().await == 1 }
    })
    .await?;

    Ok(())
}
