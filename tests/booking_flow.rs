use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use parkd::tenant::TenantManager;
use parkd::wire;

const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("parkd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, 15 * 60_000));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "parkd".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user("parkd")
        .password("parkd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn data_rows(msgs: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    msgs.into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn create_spot(
    client: &tokio_postgres::Client,
    owner: Ulid,
    total_slots: u32,
) -> Ulid {
    let spot_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO spots (id, owner_id, name, total_slots, price_cents, lat, lon) \
             VALUES ('{spot_id}', '{owner}', 'Lot 9', {total_slots}, 300, 13.7563, 100.5018)"
        ))
        .await
        .unwrap();
    spot_id
}

/// Reserve with RETURNING and hand back (booking_id, qr_code, pin).
async fn reserve_returning(
    client: &tokio_postgres::Client,
    spot_id: Ulid,
    guest: Ulid,
    start: i64,
    end: i64,
) -> (Ulid, String, String) {
    let booking_id = Ulid::new();
    let vehicle = Ulid::new();
    let rows = data_rows(
        client
            .simple_query(&format!(
                r#"INSERT INTO bookings (id, spot_id, guest_id, vehicle_id, start, "end")
                   VALUES ('{booking_id}', '{spot_id}', '{guest}', '{vehicle}', {start}, {end})
                   RETURNING id, qr_code, pin"#
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    let qr = rows[0].get("qr_code").unwrap().to_string();
    let pin = rows[0].get("pin").unwrap().to_string();
    (booking_id, qr, pin)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_spot_and_list() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let owner = Ulid::new();
    let spot_id = create_spot(&client, owner, 4).await;

    let rows = data_rows(client.simple_query("SELECT * FROM spots").await.unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id").unwrap(), spot_id.to_string());
    assert_eq!(rows[0].get("total_slots").unwrap(), "4");
    let active = rows[0].get("active").unwrap();
    assert!(active == "t" || active == "true", "unexpected bool repr: {active}");
}

#[tokio::test]
async fn reserve_returns_issued_credentials() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let spot_id = create_spot(&client, Ulid::new(), 1).await;
    let (_, qr, pin) = reserve_returning(&client, spot_id, Ulid::new(), 9 * H, 11 * H).await;

    assert_eq!(qr.len(), 32);
    assert_eq!(pin.len(), 4);
    assert!(pin.chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn overbooking_reports_remaining_capacity() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let spot_id = create_spot(&client, Ulid::new(), 1).await;
    reserve_returning(&client, spot_id, Ulid::new(), 9 * H, 17 * H).await;

    let booking_id = Ulid::new();
    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, spot_id, guest_id, vehicle_id, start, "end")
               VALUES ('{booking_id}', '{spot_id}', '{}', '{}', {}, {})"#,
            Ulid::new(),
            Ulid::new(),
            12 * H,
            14 * H
        ))
        .await
        .unwrap_err();

    let db_err = err.as_db_error().unwrap();
    assert!(db_err.message().contains("no longer available"));
    assert!(db_err.message().contains("0 slot(s) remain"));
}

#[tokio::test]
async fn half_open_adjacency_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let spot_id = create_spot(&client, Ulid::new(), 1).await;
    reserve_returning(&client, spot_id, Ulid::new(), 9 * H, 10 * H).await;
    // Ends-at-start neighbour succeeds on the same 1-slot spot
    reserve_returning(&client, spot_id, Ulid::new(), 10 * H, 11 * H).await;
}

#[tokio::test]
async fn availability_row_reflects_bookings_and_blocks() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let owner = Ulid::new();
    let spot_id = create_spot(&client, owner, 3).await;
    reserve_returning(&client, spot_id, Ulid::new(), 9 * H, 17 * H).await;

    let block_id = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO blocks (id, spot_id, owner_id, start, "end", status, slots_open, reason)
               VALUES ('{block_id}', '{spot_id}', '{owner}', {}, {}, 'maintenance', 2, 'sweeping')"#,
            10 * H,
            12 * H
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE spot_id = '{spot_id}' AND start >= {} AND \"end\" <= {}",
                10 * H,
                12 * H
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("total_slots").unwrap(), "3");
    // 1 booking + (3-2) blocked reduction
    assert_eq!(rows[0].get("occupied").unwrap(), "2");
    assert_eq!(rows[0].get("free").unwrap(), "1");

    // Deleting the block restores capacity
    client
        .batch_execute(&format!(
            "DELETE FROM blocks WHERE id = '{block_id}' AND owner_id = '{owner}'"
        ))
        .await
        .unwrap();
    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE spot_id = '{spot_id}' AND start >= {} AND \"end\" <= {}",
                10 * H,
                12 * H
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("free").unwrap(), "2");
}

#[tokio::test]
async fn free_windows_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let spot_id = create_spot(&client, Ulid::new(), 1).await;
    reserve_returning(&client, spot_id, Ulid::new(), 10 * H, 11 * H).await;

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM windows WHERE spot_id = '{spot_id}' AND start >= {} AND \"end\" <= {}",
                9 * H,
                12 * H
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("start").unwrap(), (9 * H).to_string());
    assert_eq!(rows[0].get("end").unwrap(), (10 * H).to_string());
    assert_eq!(rows[1].get("start").unwrap(), (11 * H).to_string());
}

#[tokio::test]
async fn full_booking_lifecycle_with_qr_entry() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;

    let owner = Ulid::new();
    let spot_id = create_spot(&client, owner, 1).await;
    // Window covering the present so gate validation works in real time
    let (booking_id, qr, _pin) =
        reserve_returning(&client, spot_id, Ulid::new(), now - H, now + 3 * H).await;

    // Gate scan before payment is refused
    let err = client
        .simple_query(&format!(
            "SELECT * FROM entry WHERE spot_id = '{spot_id}' AND qr_code = '{qr}'"
        ))
        .await
        .unwrap_err();
    assert!(err.as_db_error().is_some());

    // Owner verifies the payment slip
    client
        .batch_execute(&format!(
            "UPDATE bookings SET payment_status = 'verified' WHERE id = '{booking_id}' AND owner_id = '{owner}'"
        ))
        .await
        .unwrap();

    // Scan now admits the vehicle and flips the booking to active
    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM entry WHERE spot_id = '{spot_id}' AND qr_code = '{qr}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status").unwrap(), "active");

    // Exit completes the stay
    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'completed' WHERE id = '{booking_id}'"
        ))
        .await
        .unwrap();
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE spot_id = '{spot_id}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status").unwrap(), "completed");
}

#[tokio::test]
async fn entry_code_errors_are_generic() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let owner = Ulid::new();
    let spot_a = create_spot(&client, owner, 1).await;
    let spot_b = create_spot(&client, owner, 1).await;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let (booking_id, qr, _pin) =
        reserve_returning(&client, spot_a, Ulid::new(), now - H, now + 3 * H).await;
    client
        .batch_execute(&format!(
            "UPDATE bookings SET payment_status = 'verified' WHERE id = '{booking_id}' AND owner_id = '{owner}'"
        ))
        .await
        .unwrap();

    // A valid token at the wrong gate reads exactly like a bogus token
    let wrong_gate = client
        .simple_query(&format!(
            "SELECT * FROM entry WHERE spot_id = '{spot_b}' AND qr_code = '{qr}'"
        ))
        .await
        .unwrap_err();
    let bogus = client
        .simple_query(&format!(
            "SELECT * FROM entry WHERE spot_id = '{spot_b}' AND qr_code = 'ffffffffffffffffffffffffffffffff'"
        ))
        .await
        .unwrap_err();
    assert_eq!(
        wrong_gate.as_db_error().unwrap().message(),
        bogus.as_db_error().unwrap().message()
    );
    assert_eq!(
        wrong_gate.as_db_error().unwrap().message(),
        "invalid or expired code"
    );
}

#[tokio::test]
async fn cancel_over_wire_is_guest_scoped() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let spot_id = create_spot(&client, Ulid::new(), 1).await;
    let guest = Ulid::new();
    let (booking_id, _, _) = reserve_returning(&client, spot_id, guest, 9 * H, 17 * H).await;

    // A stranger may not cancel
    let err = client
        .batch_execute(&format!(
            "DELETE FROM bookings WHERE id = '{booking_id}' AND actor = '{}'",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("not the owner"));

    // The guest may
    client
        .batch_execute(&format!(
            "DELETE FROM bookings WHERE id = '{booking_id}' AND actor = '{guest}'"
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE spot_id = '{spot_id}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status").unwrap(), "cancelled");
}

#[tokio::test]
async fn tenants_are_isolated_per_database() {
    let addr = start_test_server().await;

    let mut config_a = Config::new();
    config_a
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("market_a")
        .user("parkd")
        .password("parkd");
    let (client_a, conn_a) = config_a.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = conn_a.await;
    });

    let mut config_b = Config::new();
    config_b
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("market_b")
        .user("parkd")
        .password("parkd");
    let (client_b, conn_b) = config_b.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = conn_b.await;
    });

    create_spot(&client_a, Ulid::new(), 1).await;

    let rows_a = data_rows(client_a.simple_query("SELECT * FROM spots").await.unwrap());
    let rows_b = data_rows(client_b.simple_query("SELECT * FROM spots").await.unwrap());
    assert_eq!(rows_a.len(), 1);
    assert!(rows_b.is_empty());
}
