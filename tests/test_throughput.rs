use futures::StreamExt;
use tokio::time::{timeout, Duration};

mod implementations;

const ELEMENTS: i32 = 100_000;
const DEADLINE: Duration = Duration::from_secs(60);

#[tokio::test(flavor = "multi_thread")]
async fn test_large_stream_delivers_every_element() {
    let bed = implementations::start();

    let last = timeout(DEADLINE, async {
        let mut stream = bed.client.number_stream(ELEMENTS).await.unwrap();

        let mut count = 0i32;
        let mut last = 0i32;
        while let Some(value) = stream.next().await {
            last = value.unwrap();
            count += 1;
        }

        assert_eq!(count, ELEMENTS);
        last
    })
    .await
    .expect("stream must complete within the deadline");

    assert_eq!(last, ELEMENTS);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batched_stream_delivers_every_element() {
    let bed = implementations::start();

    let last = timeout(DEADLINE, async {
        let mut stream = bed.client.number_batches(ELEMENTS, 1_000).await.unwrap();

        let mut count = 0i32;
        let mut last = 0i32;
        while let Some(batch) = stream.next().await {
            let batch = batch.unwrap();
            count += batch.len() as i32;
            last = *batch.last().unwrap();
        }

        assert_eq!(count, ELEMENTS);
        last
    })
    .await
    .expect("batched stream must complete within the deadline");

    assert_eq!(last, ELEMENTS);
}
