use mqrpc::transport::memory::DEFAULT_URI;
use mqrpc::{ExecutionMode, MemoryBroker, RpcClient, RpcError, RpcServer};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: u32,
    items: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Receipt {
    order_id: u32,
    total_items: usize,
}

mqrpc::rpc_type!(Order, Receipt);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let broker = MemoryBroker::new();

    println!("[Server] Starting RPC server");
    let server = RpcServer::new(broker.clone());
    server.setup(Some(DEFAULT_URI), None).await?;

    server
        .subscribe("add", |a: i32, b: i32| a + b, ExecutionMode::Sync)
        .await?;
    server
        .subscribe(
            "add",
            |a: String, b: String| format!("{}{}", a, b),
            ExecutionMode::Sync,
        )
        .await?;
    server
        .subscribe(
            "place_order",
            |order: Order| Receipt {
                order_id: order.id,
                total_items: order.items.len(),
            },
            ExecutionMode::Async,
        )
        .await?;
    server
        .subscribe_fallible(
            "divide",
            |a: i64, b: i64| {
                a.checked_div(b)
                    .ok_or_else(|| format!("cannot divide {} by {}", a, b))
            },
            ExecutionMode::Sync,
        )
        .await?;
    println!("[Server] {} operations subscribed", server.handler_count());

    let client = RpcClient::new(broker.clone());
    client.setup(Some(DEFAULT_URI)).await?;
    client.caller_use(|message, next| async move {
        let started = Instant::now();
        let queue = message.queue.clone();
        let reply = next.run(message).await;
        println!("[Client] {} answered in {:?}", queue, started.elapsed());
        reply
    });

    let sum: i32 = client.call_async("add", (40i32, 2i32)).await?;
    println!("[Client] add(40, 2) = {}", sum);

    let joined: String = client
        .call_async("add", ("mq".to_string(), "rpc".to_string()))
        .await?;
    println!("[Client] add(\"mq\", \"rpc\") = {}", joined);

    let receipt: Receipt = client
        .call_async(
            "place_order",
            (Order {
                id: 7,
                items: vec!["tea".into(), "scones".into()],
            },),
        )
        .await?;
    println!("[Client] place_order -> {:?}", receipt);

    match client.call_async::<i64, _>("divide", (1i64, 0i64)).await {
        Err(RpcError::Remote(remote)) => println!("[Client] divide failed remotely: {}", remote),
        other => println!("[Client] divide returned {:?}", other),
    }

    client.reset().await;
    server.reset().await;
    println!("Done!");
    Ok(())
}
