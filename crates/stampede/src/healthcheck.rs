use std::net::SocketAddr;
use std::time::Duration;

use stampede_service::config::Config;

pub fn healthcheck(config: Config, addr: Option<SocketAddr>, timeout: u64) -> anyhow::Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => config.bind.parse()?,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(check(addr, Duration::from_secs(timeout)))
}

async fn check(addr: SocketAddr, timeout: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    let url = format!("http://{addr}/healthcheck");
    tracing::debug!("Sending request to: {url}");

    match client.get(url).send().await {
        Ok(response) if response.status().is_success() => {
            println!("OK");
            Ok(())
        }
        Ok(response) => {
            println!("ERROR");
            Err(anyhow::anyhow!(
                "Stampede ({addr}) is unhealthy. Status: {}",
                response.status()
            ))
        }
        Err(error) => {
            println!("ERROR");
            Err(anyhow::anyhow!(
                "Failed to check Stampede ({addr}) health: {error}"
            ))
        }
    }
}
