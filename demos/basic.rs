use std::time::Duration;

use remootio::{ClientConfig, RemootioClient, SessionEvent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("remootio=debug")),
        )
        .init();

    // Keys are shown in the Remootio app once the websocket API is enabled.
    let config = ClientConfig::new(
        std::env::var("REMOOTIO_ADDRESS")?,
        std::env::var("REMOOTIO_SECRET_KEY")?,
        std::env::var("REMOOTIO_AUTH_KEY")?,
    )
    .with_keepalive_interval(Duration::from_secs(30));

    let client = RemootioClient::new(config)?;
    let mut events = client.subscribe();
    client.connect(true)?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event? {
                SessionEvent::Authenticated => {
                    println!("authenticated, querying gate state");
                    client.send_query()?;
                }
                SessionEvent::IncomingMessage { payload: Some(payload), .. } => {
                    println!("device: {payload:?}");
                }
                SessionEvent::Error(err) => println!("error: {err}"),
                other => println!("{other:?}"),
            },
        }
    }

    client.disconnect();
    client.wait_closed().await;
    Ok(())
}
