use std::error::Error;

use fishfish_sdk::stream::client::StreamClient;
use fishfish_sdk::stream::dispatcher::{DispatchError, HandlerError};
use fishfish_sdk::stream::proto::{EventType, StreamEvent};
use secrecy::SecretString;

async fn on_domain_create(event: StreamEvent) -> Result<(), HandlerError> {
    if let StreamEvent::DomainCreate(created) = event {
        println!(
            "{} was just created category={:?}",
            created.domain, created.category
        );
    }
    Ok(())
}

async fn on_error(failure: DispatchError) -> Result<(), HandlerError> {
    eprintln!("stream event failed: {failure}");
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let refresh_secret = std::env::var("FISHFISH_API_KEY")
        .unwrap_or_else(|_| "REPLACE_WITH_API_KEY".to_string());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = StreamClient::from_refresh_secret(SecretString::new(refresh_secret))?;
        client.register_error_handler(on_error);
        client.register_listener(EventType::DomainCreate, on_domain_create);
        client.register_listener(EventType::UrlDelete, |event| async move {
            println!("{} was removed", event.subject());
            Ok::<(), HandlerError>(())
        });

        // Runs until the service closes the connection or it fails.
        client.start().join().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
