use std::time::Duration;

use kym_dispatch::prelude::{DispatchError, Dispatcher, RetryPolicy};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = Dispatcher::builder()
        .base_url("https://httpbin.org/")
        .client_name("kym-demo-error-handling")
        .default_timeout(Duration::from_secs(3))
        .retry_policy(RetryPolicy::standard().max_retries(1))
        .try_build()?;

    let response = dispatcher.get("status/404").send().await?;
    println!("raw entry point: status={}", response.status());

    match dispatcher.get("status/500").send_decoded().await {
        Ok(payload) => println!("unexpected success: {payload:?}"),
        Err(error) => {
            println!("error_code={}", error.code().as_str());
            match &error {
                DispatchError::HttpStatus { status, body, .. } => {
                    println!("http status error: status={status} body={body}");
                }
                DispatchError::Timeout { timeout_ms, .. } => {
                    println!("timeout: timeout_ms={timeout_ms}");
                }
                DispatchError::Transport { kind, .. } => {
                    println!("transport error kind={kind}");
                }
                other => {
                    println!("other error: {other}");
                }
            }
        }
    }

    Ok(())
}
