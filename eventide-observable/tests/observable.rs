use anyhow::Result;
use eventide_observable::{Observable, Observer, ReplayObservable};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

async fn next<T: Clone + Send + 'static>(observer: &mut Observer<T>) -> Result<Option<T>> {
    Ok(tokio::time::timeout(RECV_TIMEOUT, observer.recv()).await?)
}

#[tokio::test]
async fn late_subscriber_receives_backlog_before_live_values() -> Result<()> {
    let ctx = CancellationToken::new();
    let (replay, publisher) = ReplayObservable::<u32>::new(&ctx, 4);

    for value in 0..3 {
        publisher.publish(value);
    }
    let mut observer = replay.subscribe(&ctx);
    publisher.publish(3);

    for expected in 0..4 {
        assert_eq!(next(&mut observer).await?, Some(expected));
    }
    Ok(())
}

#[tokio::test]
async fn replay_keeps_only_the_most_recent_values() -> Result<()> {
    let ctx = CancellationToken::new();
    let (replay, publisher) = ReplayObservable::<u32>::new(&ctx, 3);

    for value in 0..4 {
        publisher.publish(value);
    }
    let mut observer = replay.subscribe(&ctx);

    assert_eq!(next(&mut observer).await?, Some(1));
    assert_eq!(next(&mut observer).await?, Some(2));
    assert_eq!(next(&mut observer).await?, Some(3));
    assert!(observer.try_recv().is_none());
    Ok(())
}

#[tokio::test]
async fn observers_see_values_in_publish_order_until_cancelled() -> Result<()> {
    let ctx = CancellationToken::new();
    let (observable, publisher) = Observable::<String>::new();
    let mut observer = observable.subscribe(&ctx);

    let producer = tokio::spawn(async move {
        for i in 0..5 {
            publisher.publish(format!("message_{i}"));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        publisher
    });

    for i in 0..5 {
        assert_eq!(next(&mut observer).await?, Some(format!("message_{i}")));
    }
    // The publisher is still alive, so the channel stays open.
    let _publisher = producer.await?;
    assert!(
        tokio::time::timeout(Duration::from_millis(50), observer.recv())
            .await
            .is_err()
    );

    ctx.cancel();
    assert_eq!(next(&mut observer).await?, None);
    Ok(())
}

#[tokio::test]
async fn unsubscribe_all_closes_current_and_future_observers() -> Result<()> {
    let ctx = CancellationToken::new();
    let (replay, publisher) = ReplayObservable::<u32>::new(&ctx, 2);
    let mut early = replay.subscribe(&ctx);

    publisher.publish(9);
    replay.unsubscribe_all();
    publisher.publish(10);

    assert_eq!(next(&mut early).await?, Some(9));
    assert_eq!(next(&mut early).await?, None);

    let mut late = replay.subscribe(&ctx);
    assert_eq!(next(&mut late).await?, Some(9));
    assert_eq!(next(&mut late).await?, None);
    Ok(())
}

#[tokio::test]
async fn observer_stream_yields_values() -> Result<()> {
    use futures::StreamExt;

    let ctx = CancellationToken::new();
    let (observable, publisher) = Observable::<u32>::new();
    let stream = observable.subscribe(&ctx).into_stream();

    publisher.publish(1);
    publisher.publish(2);
    drop(publisher);

    let values: Vec<u32> = tokio::time::timeout(RECV_TIMEOUT, stream.collect()).await?;
    assert_eq!(values, vec![1, 2]);
    Ok(())
}
