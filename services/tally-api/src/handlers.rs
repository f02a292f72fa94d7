use crate::errors::{ApiError, Result};
use crate::models::{
    BalanceQuery, CreateAccountRequest, CreateAccountResponse, CreateUserRequest,
    CreateUserResponse, MovementRequest, ReplayResponse, TransferRequest,
};
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tally_core::{FeedRequest, Identifier, Ledger, LedgerError, Outcome};
use validator::Validate;

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "tally-api",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Parse an identifier from a request, rejecting forged future timestamps
fn parse_id(ledger: &Ledger, raw: &str, field: &str) -> Result<Identifier> {
    Identifier::parse_validated(raw, ledger.clock().as_ref())
        .map_err(|e| ApiError::Validation(format!("{}: {}", field, e)))
}

fn outcome_response<T: Serialize>(outcome: Outcome<T>) -> HttpResponse {
    match outcome {
        Outcome::Applied(receipt) => HttpResponse::Created().json(receipt),
        Outcome::Replayed => HttpResponse::Ok().json(ReplayResponse { replayed: true }),
    }
}

/// Create user endpoint
pub async fn create_user(
    ledger: web::Data<Ledger>,
    request: web::Json<CreateUserRequest>,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    request.validate()?;

    let user = ledger.create_user(&request.name).await?;
    Ok(HttpResponse::Created().json(CreateUserResponse { user_id: user.id }))
}

/// Create account endpoint
pub async fn create_account(
    ledger: web::Data<Ledger>,
    request: web::Json<CreateAccountRequest>,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    request.validate()?;

    let user_id = parse_id(&ledger, &request.user_id, "userId")?;
    let account = ledger.create_account(user_id).await?;
    Ok(HttpResponse::Created().json(CreateAccountResponse {
        account_id: account.id,
    }))
}

/// Deposit endpoint
pub async fn deposit(
    ledger: web::Data<Ledger>,
    account_id: web::Path<String>,
    request: web::Json<MovementRequest>,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    request.validate()?;

    let account = parse_id(&ledger, &account_id, "account_id")?;
    let outcome = ledger
        .deposit(account, request.amount, &request.idempotency_key)
        .await?;
    Ok(outcome_response(outcome))
}

/// Withdraw endpoint
pub async fn withdraw(
    ledger: web::Data<Ledger>,
    account_id: web::Path<String>,
    request: web::Json<MovementRequest>,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    request.validate()?;

    let account = parse_id(&ledger, &account_id, "account_id")?;
    let outcome = ledger
        .withdraw(account, request.amount, &request.idempotency_key)
        .await?;
    Ok(outcome_response(outcome))
}

/// Transfer endpoint
pub async fn transfer(
    ledger: web::Data<Ledger>,
    account_id: web::Path<String>,
    request: web::Json<TransferRequest>,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    request.validate()?;

    let from = parse_id(&ledger, &account_id, "account_id")?;
    let to = parse_id(&ledger, &request.external_account, "externalAccount")?;
    let outcome = ledger
        .transfer(from, to, request.amount, &request.idempotency_key)
        .await?;
    Ok(outcome_response(outcome))
}

/// Point-in-time balance endpoint
pub async fn get_balance(
    ledger: web::Data<Ledger>,
    account_id: web::Path<String>,
    query: web::Query<BalanceQuery>,
) -> Result<HttpResponse> {
    let account = parse_id(&ledger, &account_id, "account_id")?;
    let at = match query.timestamp.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| ApiError::Validation(format!("timestamp: {}", e)))?
            .with_timezone(&Utc),
        None => ledger.clock().now(),
    };

    let snapshot = ledger.balance_as_of(account, at).await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

/// Transaction feed endpoint
///
/// `accountId` may repeat, so the query string is read as pairs.
pub async fn list_transactions(
    ledger: web::Data<Ledger>,
    query: web::Query<Vec<(String, String)>>,
) -> Result<HttpResponse> {
    let mut request = FeedRequest::default();
    for (key, value) in query.into_inner() {
        match key.as_str() {
            "accountId" => request.accounts.push(parse_id(&ledger, &value, "accountId")?),
            "cursor" => request.cursor = Some(parse_id(&ledger, &value, "cursor")?),
            "limit" => {
                request.limit = value
                    .parse()
                    .map_err(|_| ApiError::Validation(format!("limit: not an integer: {}", value)))?
            }
            _ => {}
        }
    }

    let page = ledger.list_transactions(&request).await?;
    Ok(HttpResponse::Ok().json(page))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint(ledger: web::Data<Ledger>) -> Result<HttpResponse> {
    let body = ledger.metrics().encode().map_err(LedgerError::from)?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| ApiError::Validation(err.to_string()).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| ApiError::Validation(err.to_string()).into()),
    )
    .route("/health", web::get().to(health_check))
    .route("/metrics", web::get().to(metrics_endpoint))
    .route("/users", web::post().to(create_user))
    .route("/accounts", web::post().to(create_account))
    .route("/accounts/{account_id}/balance", web::get().to(get_balance))
    .route("/accounts/{account_id}/deposit", web::post().to(deposit))
    .route("/accounts/{account_id}/withdraw", web::post().to(withdraw))
    .route("/accounts/{account_id}/transfer", web::post().to(transfer))
    .route("/transactions", web::get().to(list_transactions));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::Value;
    use tally_core::EngineConfig;

    fn ledger() -> Ledger {
        Ledger::in_memory(&EngineConfig::default()).unwrap()
    }

    macro_rules! app {
        ($ledger:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($ledger.clone()))
                    .configure(configure_routes),
            )
            .await
        };
    }

    async fn account_with_user(ledger: &Ledger) -> Identifier {
        let user = ledger.create_user("tester").await.unwrap();
        ledger.create_account(user.id).await.unwrap().id
    }

    #[actix_web::test]
    async fn test_health() {
        let ledger = ledger();
        let app = app!(ledger);
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
    }

    #[actix_web::test]
    async fn test_create_user_and_account() {
        let ledger = ledger();
        let app = app!(ledger);

        let req = test::TestRequest::post()
            .uri("/users")
            .set_json(json!({ "name": "alice" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        let user_id = body["userId"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri("/accounts")
            .set_json(json!({ "userId": user_id }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["accountId"].as_str().unwrap().parse::<Identifier>().is_ok());
    }

    #[actix_web::test]
    async fn test_account_for_unknown_user_is_404() {
        let ledger = ledger();
        let app = app!(ledger);
        let stranger = Identifier::from_bytes([0, 0, 0, 1, 0, 0, 9, 9, 9, 9, 9]);

        let req = test::TestRequest::post()
            .uri("/accounts")
            .set_json(json!({ "userId": stranger.to_string() }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "not_found");
    }

    #[actix_web::test]
    async fn test_deposit_then_replay() {
        let ledger = ledger();
        let account = account_with_user(&ledger).await;
        let app = app!(ledger);
        let uri = format!("/accounts/{}/deposit", account);

        let req = test::TestRequest::post()
            .uri(&uri)
            .set_json(json!({ "amount": 100, "idempotencyKey": "k1" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["type"], "deposit");
        assert_eq!(body["endingBalance"], "100.0000");

        let req = test::TestRequest::post()
            .uri(&uri)
            .set_json(json!({ "amount": 100, "idempotencyKey": "k1" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["replayed"], true);
    }

    #[actix_web::test]
    async fn test_withdraw_insufficient_funds_is_400() {
        let ledger = ledger();
        let account = account_with_user(&ledger).await;
        let app = app!(ledger);

        let req = test::TestRequest::post()
            .uri(&format!("/accounts/{}/withdraw", account))
            .set_json(json!({ "amount": "0.0001", "idempotencyKey": "w" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "insufficient_funds");
        assert_eq!(body["error"]["code"], 400);
    }

    #[actix_web::test]
    async fn test_transfer_returns_both_legs() {
        let ledger = ledger();
        let from = account_with_user(&ledger).await;
        let to = account_with_user(&ledger).await;
        ledger.deposit(from, rust_decimal_macros::dec!(100), "seed").await.unwrap();
        let app = app!(ledger);

        let req = test::TestRequest::post()
            .uri(&format!("/accounts/{}/transfer", from))
            .set_json(json!({
                "amount": "50",
                "idempotencyKey": "X",
                "externalAccount": to.to_string()
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["outgoing"]["type"], "transfer_out");
        assert_eq!(body["incoming"]["type"], "transfer_in");
        assert_eq!(body["outgoing"]["relatedTransactionId"], body["incoming"]["id"]);
    }

    #[actix_web::test]
    async fn test_malformed_path_id_is_400() {
        let ledger = ledger();
        let app = app!(ledger);

        let req = test::TestRequest::post()
            .uri("/accounts/not-an-id/deposit")
            .set_json(json!({ "amount": 1, "idempotencyKey": "k" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_missing_field_is_400_with_error_body() {
        let ledger = ledger();
        let account = account_with_user(&ledger).await;
        let app = app!(ledger);

        let req = test::TestRequest::post()
            .uri(&format!("/accounts/{}/deposit", account))
            .set_json(json!({ "amount": 1 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "validation_error");
    }

    #[actix_web::test]
    async fn test_balance_endpoint() {
        let ledger = ledger();
        let account = account_with_user(&ledger).await;
        ledger.deposit(account, rust_decimal_macros::dec!(42), "d").await.unwrap();
        let app = app!(ledger);

        let req = test::TestRequest::get()
            .uri(&format!("/accounts/{}/balance", account))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["balance"], "42.0000");

        let req = test::TestRequest::get()
            .uri(&format!(
                "/accounts/{}/balance?timestamp=2020-06-01T00:00:00Z",
                account
            ))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["balance"], "0.0000");

        let req = test::TestRequest::get()
            .uri(&format!("/accounts/{}/balance?timestamp=yesterday", account))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_transactions_pagination() {
        let ledger = ledger();
        let account = account_with_user(&ledger).await;
        let other = account_with_user(&ledger).await;
        for n in 0..5 {
            ledger
                .deposit(account, rust_decimal_macros::dec!(1), &format!("d-{n}"))
                .await
                .unwrap();
        }
        ledger.deposit(other, rust_decimal_macros::dec!(1), "o").await.unwrap();
        let app = app!(ledger);

        let req = test::TestRequest::get()
            .uri(&format!("/transactions?accountId={}&limit=2", account))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["transactions"].as_array().unwrap().len(), 2);
        let cursor = body["nextCursor"].as_str().unwrap().to_string();

        let req = test::TestRequest::get()
            .uri(&format!(
                "/transactions?accountId={}&accountId={}&cursor={}&limit=10",
                account, other, cursor
            ))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["transactions"].as_array().unwrap().len(), 4);
        assert!(body.get("nextCursor").is_none());

        let req = test::TestRequest::get()
            .uri("/transactions?limit=abc")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_metrics_endpoint() {
        let ledger = ledger();
        let account = account_with_user(&ledger).await;
        ledger.deposit(account, rust_decimal_macros::dec!(1), "m").await.unwrap();
        let app = app!(ledger);

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("tally_operations_total"));
    }
}
