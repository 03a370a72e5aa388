use std::time::Duration;

use kym_dispatch::prelude::{Dispatcher, RetryPolicy};
use tokio::time::Instant;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = Dispatcher::builder()
        .base_url("https://httpbin.org/")
        .client_name("kym-demo-concurrency")
        .default_timeout(Duration::from_secs(5))
        .retry_policy(RetryPolicy::disabled())
        .max_concurrency(4)
        .max_concurrency_per_origin(1)
        .try_build()?;

    let started = Instant::now();
    let mut handles = Vec::new();

    for idx in 0..3 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            let result = dispatcher
                .get(format!("delay/1?n={idx}"))
                .send()
                .await;
            (idx, result.map(|response| response.status().as_u16()))
        }));
    }

    for handle in handles {
        let (idx, result) = handle.await?;
        match result {
            Ok(status) => println!("request-{idx} status={status}"),
            Err(error) => println!("request-{idx} error={error}"),
        }
    }

    let snapshot = dispatcher.metrics_snapshot();
    println!(
        "elapsed_ms={} origins={} executions={}",
        started.elapsed().as_millis(),
        dispatcher.origin_count(),
        snapshot.executions
    );
    Ok(())
}
