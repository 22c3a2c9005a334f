use std::error::Error;

use fishfish_sdk::api::{ApiClient, FishClient};
use fishfish_sdk::stream::proto::Category;
use reqwest::Method;
use secrecy::SecretString;
use serde_json::Value;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let refresh_secret = std::env::var("FISHFISH_API_KEY")
        .unwrap_or_else(|_| "REPLACE_WITH_API_KEY".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = FishClient::with_refresh_secret(
            ApiClient::new()?,
            SecretString::new(refresh_secret),
        );

        let domain: Value = client
            .request(Method::GET, "/domains/steamncommunty.ru", None, false)
            .await?;
        println!("{domain}");

        let path = FishClient::collection_path("domains", Some(Category::Safe), true);
        let domains: Vec<Value> = client.request(Method::GET, &path, None, true).await?;
        println!("safe domains: {}", domains.len());

        Ok::<(), Box<dyn Error>>(())
    })
}
