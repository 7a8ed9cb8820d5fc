use goose::prelude::*;
use serde_json::{Value, json};
use std::env;

fn subject_phone() -> String {
    env::var("SUBJECT_PHONE").unwrap_or_else(|_| "01012345678".to_string())
}

async fn health_check(user: &mut GooseUser) -> TransactionResult {
    let _goose_metrics = user.get("/healthz").await?;
    Ok(())
}

/// Open a session and read its status back, the way a relying back end polls it.
async fn init_and_status(user: &mut GooseUser) -> TransactionResult {
    let body = json!({
        "name": "Load Test",
        "phoneNumber": subject_phone(),
    });
    let goose_metrics = user.post_json("/api/v1/auth/init", &body).await?;

    let token_id = match goose_metrics.response {
        Ok(response) => match response.json::<Value>().await {
            Ok(value) => value["tokenId"].as_str().map(str::to_string),
            Err(_) => None,
        },
        Err(_) => None,
    };

    if let Some(token_id) = token_id {
        let path = format!("/api/v1/auth/status/{token_id}");
        let _goose_metrics = user.get(&path).await?;
    }
    Ok(())
}

/// Unknown tokens must stay cheap to reject.
async fn unknown_status(user: &mut GooseUser) -> TransactionResult {
    let _goose_metrics = user.get("/api/v1/auth/status/unknown-token").await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    println!("Subject phone for init calls: {}", subject_phone());

    GooseAttack::initialize()?
        .register_scenario(
            scenario!("HealthCheck").register_transaction(transaction!(health_check)),
        )
        .register_scenario(
            scenario!("AuthorityTests")
                .register_transaction(transaction!(init_and_status))
                .register_transaction(transaction!(unknown_status)),
        )
        .execute()
        .await?;

    Ok(())
}
