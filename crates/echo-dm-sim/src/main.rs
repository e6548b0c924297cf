//! Two devices, one in-process directory: registration, first contact,
//! replies, prekey replenishment and safety-number comparison.

use std::sync::Arc;

use echo_signal::signal::ReplenishOutcome;
use echo_signal::{
    DmClient, KeyStore, MemoryDirectory, MemoryKeyStore, SignalConfig, SignalStore,
    SqliteKeyStore, TrustPolicy,
};

/// Command-line arguments for the simulation.
struct Args {
    config_path: String,
    db_path: String,
    messages: usize,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut config_path = String::new();
    let mut db_path = String::new();
    let mut messages = 3;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next().unwrap_or_default(),
            "--db" => db_path = args.next().unwrap_or_default(),
            "--messages" => {
                messages = args
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(messages);
            }
            _ => {}
        }
    }

    Args {
        config_path,
        db_path,
        messages,
    }
}

fn load_config(path: &str) -> SignalConfig {
    if path.is_empty() {
        return SignalConfig::default();
    }
    let json = std::fs::read_to_string(path).expect("failed to read config file");
    SignalConfig::from_json(&json).expect("invalid config file")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = parse_args();
    let config = load_config(&args.config_path);
    tracing::info!(?config, "echo-dm-sim starting");

    let directory = MemoryDirectory::new();

    let alice = DmClient::new(
        SignalStore::in_memory(),
        Arc::new(directory.for_user("alice")),
        config.clone(),
    );

    // Bob optionally keeps his keys on disk across runs.
    let bob_keys: Arc<dyn KeyStore> = if args.db_path.is_empty() {
        Arc::new(MemoryKeyStore::new())
    } else {
        Arc::new(SqliteKeyStore::open(&args.db_path).expect("failed to open key store"))
    };
    let bob = DmClient::new(
        SignalStore::new(bob_keys, TrustPolicy::default()),
        Arc::new(directory.for_user("bob")),
        config.clone(),
    );
    // Alice is new every run; a pinned key from an earlier run would be refused.
    bob.reset_all_sessions().await.expect("failed to reset sessions");

    let alice_device = alice.init_device().await.expect("alice registration failed");
    let bob_device = bob.init_device().await.expect("bob registration failed");
    tracing::info!(
        alice = %alice_device.device_id,
        bob = %bob_device.device_id,
        "devices registered"
    );

    for i in 0..args.messages {
        let text = format!("message {i} from alice");
        let envelope = alice.send_text("bob", &text).await.expect("alice send failed");
        let received = bob.read_text("alice", &envelope).await.expect("bob read failed");
        println!("alice -> bob [{}]: {received}", &envelope[..1]);

        let reply = format!("reply {i} from bob");
        let envelope = bob.send_text("alice", &reply).await.expect("bob send failed");
        let received = alice.read_text("bob", &envelope).await.expect("alice read failed");
        println!("bob -> alice [{}]: {received}", &envelope[..1]);
    }

    let garbled = bob.read_text("alice", "1:not-a-message").await.expect("bob read failed");
    println!("garbled envelope renders as: {garbled}");

    match bob.replenish().await {
        ReplenishOutcome::Replenished { submitted } => println!("bob replenished {submitted} prekeys"),
        ReplenishOutcome::NotNeeded { remaining } => println!("bob has {remaining} prekeys left"),
        other => println!("bob replenishment: {other:?}"),
    }

    let on_alice = alice.safety_number("bob").await.expect("safety number failed");
    let on_bob = bob.safety_number("alice").await.expect("safety number failed");
    println!("safety number (alice): {on_alice}");
    println!("safety number (bob):   {on_bob}");
    println!("match: {}", on_alice == on_bob);

    tracing::info!("echo-dm-sim done");
}
