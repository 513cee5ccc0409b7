//! End-to-end scenarios driven against [`Engine`] without a real upstream
//! socket: frames are fed in directly the way the wire layer would deliver
//! them, and downstream broadcast output is read back off the hub.

use gateway_core::config::GatewayConfig;
use gateway_core::downstream::DownstreamEvent;
use gateway_core::engine::Engine;
use gateway_core::order::OrderType;
use serde_json::json;

fn test_config() -> GatewayConfig {
    GatewayConfig { api_route: "DEMO".to_string(), ..GatewayConfig::default() }
}

#[tokio::test]
async fn account_selection_then_order_submission_publishes_status() {
    let mut engine = Engine::new(test_config());
    let (_client, mut downstream) = engine.open_client();

    engine.apply_accounts_response(vec![json!({
        "BANK": "B", "BRANCH": "BR", "CUSTOMER": "C", "DEPOSIT": "D1"
    })]);

    let mut saw_accounts = false;
    let mut saw_up = false;
    for _ in 0..2 {
        match downstream.recv().await.unwrap() {
            DownstreamEvent::Accounts(accounts) => {
                assert_eq!(accounts, vec!["B.BR.C.D1".to_string()]);
                saw_accounts = true;
            }
            DownstreamEvent::ConnectionStatusChanged(status) => {
                assert_eq!(status, "Up");
                saw_up = true;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_accounts && saw_up);

    engine.set_account("B.BR.C.D1").unwrap();
    match downstream.recv().await.unwrap() {
        DownstreamEvent::CurrentAccount(account) => assert_eq!(account, "B.BR.C.D1"),
        other => panic!("unexpected event: {other:?}"),
    }

    let client_order_id = engine
        .submit_order("B.BR.C.D1", OrderType::Market, "AAPL", 100, None, None)
        .expect("submit_order should succeed for a known account");

    let update = gateway_core::FieldMap::from([
        ("ORDER_ID".to_string(), json!("S1")),
        ("ORIGINAL_ORDER_ID".to_string(), json!("O1")),
        ("CLIENT_ORDER_ID".to_string(), json!(client_order_id)),
        ("CURRENT_STATUS".to_string(), json!("PENDING")),
        ("TYPE".to_string(), json!("UserSubmitOrder")),
        ("BANK".to_string(), json!("B")),
        ("BRANCH".to_string(), json!("BR")),
        ("CUSTOMER".to_string(), json!("C")),
        ("DEPOSIT".to_string(), json!("D1")),
    ]);
    let applied = engine.apply_order_update(update).expect("pending order should apply");
    assert_eq!(applied.2, "Submitted");

    match downstream.recv().await.unwrap() {
        DownstreamEvent::OrderStatus { permid, line } => {
            assert_eq!(permid, "O1");
            assert!(line.contains("Submitted"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn submit_order_rejects_unknown_account() {
    let mut engine = Engine::new(test_config());
    engine.apply_accounts_response(vec![json!({
        "BANK": "B", "BRANCH": "BR", "CUSTOMER": "C", "DEPOSIT": "D1"
    })]);
    let err = engine
        .submit_order("nobody.here.at.all", OrderType::Market, "AAPL", 10, None, None)
        .unwrap_err();
    assert!(err.to_string().contains("account unknown"));
}

#[tokio::test]
async fn symbol_subscription_emits_quote_and_trade() {
    let mut engine = Engine::new(test_config());
    let (client, mut downstream) = engine.open_client();
    engine.enable_symbol("AAPL", client);

    let row = gateway_core::FieldMap::from([
        ("BID".to_string(), json!("100.0")),
        ("BIDSIZE".to_string(), json!("5")),
        ("ASK".to_string(), json!("100.5")),
        ("ASKSIZE".to_string(), json!("3")),
        ("TRDPRC_1".to_string(), json!("100.2")),
        ("TRDVOL_1".to_string(), json!("10")),
        ("ACVOL_1".to_string(), json!("1000")),
    ]);
    engine.apply_symbol_update("AAPL", &row);

    let mut saw_quote = false;
    let mut saw_trade = false;
    for _ in 0..2 {
        match downstream.recv().await.unwrap() {
            DownstreamEvent::Quote { symbol, .. } => {
                assert_eq!(symbol, "AAPL");
                saw_quote = true;
            }
            DownstreamEvent::Trade { symbol, .. } => {
                assert_eq!(symbol, "AAPL");
                saw_trade = true;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_quote && saw_trade);
}
