//! Demo: run a handful of samples against the in-memory provider.
//!
//! Run with: `cargo run` (set `RUST_LOG=duroflow=debug` for dispatcher detail)

use std::sync::Arc;
use std::time::Duration;

use duroflow::providers::in_memory::InMemoryProvider;
use duroflow::samples::{self, billing, greetings, interactive};
use duroflow::{OrchestrationStatus, Runtime, RuntimeOptions};

const WAIT: Duration = Duration::from_secs(30);

fn describe(status: &OrchestrationStatus) -> String {
    match status {
        OrchestrationStatus::Completed { output } => format!("completed: {output}"),
        OrchestrationStatus::Failed { details } => format!("failed: {}", details.display_message()),
        other => format!("{other:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryProvider::new());
    let rt = Runtime::start_with_options(
        store,
        Arc::new(samples::activities()),
        samples::orchestrations(),
        RuntimeOptions::from_env(),
    )
    .await;
    let client = rt.client();

    client
        .start_orchestration("greeting-1", greetings::GREETING, "World")
        .await?;
    client
        .start_orchestration("parallel-1", greetings::PARALLEL, "World")
        .await?;
    client
        .start_orchestration_typed(
            "counter-can-1",
            greetings::CONTINUE_AS_NEW_COUNTER,
            greetings::CounterProgress { count: 0, max_count: 2 },
        )
        .await?;
    client
        .start_orchestration_typed(
            "subscription-1",
            billing::SUBSCRIPTION,
            billing::SubscriptionParams {
                customer_id: "cust_42".to_string(),
                plan_id: "pro".to_string(),
            },
        )
        .await?;

    for instance in ["greeting-1", "parallel-1", "counter-can-1", "subscription-1"] {
        let status = client.wait_for_orchestration(instance, WAIT).await?;
        println!("{instance}: {}", describe(&status));
    }
    println!(
        "counter-can-1 ran {} executions",
        client.list_executions("counter-can-1").await?.len()
    );

    // Updates and queries against a live instance
    client
        .start_orchestration("counter-1", interactive::COUNTER, "10")
        .await?;
    let after_increment = client
        .update("counter-1", None, "increment", "5", WAIT)
        .await?;
    println!("counter-1 after increment: {after_increment}");
    match client.update("counter-1", None, "decrement", "100", WAIT).await {
        Ok(v) => println!("counter-1 after decrement: {v}"),
        Err(e) => println!("counter-1 decrement rejected: {e}"),
    }
    println!(
        "counter-1 query: {}",
        client.query("counter-1", None, "get_counter").await?
    );
    client
        .raise_signal("counter-1", None, interactive::FINISH_SIGNAL, "")
        .await?;
    let status = client.wait_for_orchestration("counter-1", WAIT).await?;
    println!("counter-1: {}", describe(&status));

    rt.shutdown().await;
    Ok(())
}
