use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use paddock::tenant::TenantManager;
use paddock::wire;

const ADMIN: &str = "office@paddock.test";
const PASSWORD: &str = "paddock";
const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("paddock_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, Some(ADMIN.to_string())));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, email: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("stable")
        .user(email)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"))
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.err().unwrap();
    err.as_db_error().unwrap().code().code().to_string()
}

fn col<'a>(row: &'a SimpleQueryRow, name: &str) -> &'a str {
    row.get(name).unwrap_or_else(|| panic!("{name} is NULL"))
}

fn future_day() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    (now / DAY + 2) * DAY
}

async fn create_user(admin: &Client, email: &str, name: &str) -> Ulid {
    let id = Ulid::new();
    let r = rows(
        admin,
        &format!("INSERT INTO users (id, email, name, role) VALUES ('{id}', '{email}', '{name}', 'USER')"),
    )
    .await;
    assert_eq!(col(&r[0], "outcome"), "CREATED");
    id
}

async fn create_resource(admin: &Client, name: &str) -> Ulid {
    let id = Ulid::new();
    rows(admin, &format!("INSERT INTO resources (id, name) VALUES ('{id}', '{name}')")).await;
    id
}

fn book_sql(id: Ulid, resource: Ulid, start: i64, end: i64, ack: bool) -> String {
    format!(
        r#"INSERT INTO reservations (id, resource_id, start, "end", purpose, notes, acknowledge_overlap) VALUES ('{id}', '{resource}', {start}, {end}, 'TRAINING', 'private note', {ack})"#
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn admin_is_seeded_and_can_list() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;

    let users = rows(&admin, "SELECT * FROM users").await;
    assert_eq!(users.len(), 1);
    assert_eq!(col(&users[0], "email"), ADMIN);
    assert_eq!(col(&users[0], "role"), "ADMIN");

    let rid = create_resource(&admin, "Indoor arena").await;
    let resources = rows(&admin, "SELECT * FROM resources").await;
    assert_eq!(resources.len(), 1);
    assert_eq!(col(&resources[0], "id"), rid.to_string());
    assert_eq!(col(&resources[0], "active"), "t");
}

#[tokio::test]
async fn unknown_login_is_rejected() {
    let addr = start_test_server().await;
    let stranger = connect(addr, "stranger@paddock.test").await;
    assert_eq!(sqlstate(&stranger, "SELECT * FROM resources").await, "28000");
}

#[tokio::test]
async fn parse_errors_are_syntax_errors() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    assert_eq!(sqlstate(&admin, "INSERT INTO horses (id) VALUES ('x')").await, "42601");
    assert_eq!(sqlstate(&admin, "SELECT * FROM reservations WHERE resource_id = 'nope'").await, "42601");
}

#[tokio::test]
async fn booking_block_restore_scenario() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    let rid = create_resource(&admin, "Indoor arena").await;
    create_user(&admin, "alice@paddock.test", "Alice").await;
    let bob_id = create_user(&admin, "bob@paddock.test", "Bob").await;
    let alice = connect(addr, "alice@paddock.test").await;
    let bob = connect(addr, "bob@paddock.test").await;
    let day = future_day();

    // Alice books 10:00-11:00.
    let a1 = Ulid::new();
    let r = rows(&alice, &book_sql(a1, rid, day + 10 * HOUR, day + 11 * HOUR, false)).await;
    assert_eq!(col(&r[0], "outcome"), "CREATED");
    assert_eq!(col(&r[0], "status"), "CONFIRMED");

    // Bob overlaps: asked to acknowledge, nothing written.
    let b1 = Ulid::new();
    let sql = book_sql(b1, rid, day + 10 * HOUR + HOUR / 2, day + 12 * HOUR, false);
    let r = rows(&bob, &sql).await;
    assert_eq!(r.len(), 1);
    assert_eq!(col(&r[0], "outcome"), "OVERLAP_EXISTS");
    assert_eq!(col(&r[0], "id"), a1.to_string());
    assert_eq!(r[0].get("notes"), None);
    let r = rows(&bob, &sql).await;
    assert_eq!(col(&r[0], "outcome"), "OVERLAP_EXISTS");

    // Acknowledged.
    let r = rows(&bob, &book_sql(b1, rid, day + 10 * HOUR + HOUR / 2, day + 12 * HOUR, true)).await;
    assert_eq!(col(&r[0], "outcome"), "CREATED");

    // Calendar: both visible, Bob only sees his own notes.
    let calendar = format!(
        r#"SELECT * FROM reservations WHERE resource_id = '{rid}' AND start >= {} AND "end" <= {}"#,
        day,
        day + DAY
    );
    let r = rows(&bob, &calendar).await;
    assert_eq!(r.len(), 2);
    for row in &r {
        let mine = col(row, "user_id") == bob_id.to_string();
        assert_eq!(row.get("notes").is_some(), mine);
    }

    // Unconfirmed block over live bookings lists them.
    let block = Ulid::new();
    let block_sql = |confirm: bool| {
        format!(
            r#"INSERT INTO blocks (id, resource_id, reason, start, "end", confirm_conflicts) VALUES ('{block}', '{rid}', 'Footing repair', {}, {}, {confirm})"#,
            day + 9 * HOUR,
            day + 13 * HOUR
        )
    };
    let r = rows(&admin, &block_sql(false)).await;
    assert_eq!(r.len(), 2);
    assert!(r.iter().all(|row| col(row, "outcome") == "CONFLICTS_EXIST"));

    let r = rows(&admin, &block_sql(true)).await;
    assert_eq!(col(&r[0], "outcome"), "CREATED");
    assert_eq!(col(&r[0], "affected"), "2");

    let mine = rows(&bob, &format!("SELECT * FROM reservations WHERE user_id = '{bob_id}'")).await;
    assert_eq!(col(&mine[0], "status"), "IMPACTED");

    // New bookings inside the block are refused outright.
    let refused = book_sql(Ulid::new(), rid, day + 9 * HOUR, day + 10 * HOUR, true);
    assert_eq!(sqlstate(&alice, &refused).await, "23P01");

    // Lifting the block restores both.
    let r = rows(&admin, &format!("DELETE FROM blocks WHERE id = '{block}'")).await;
    assert_eq!(col(&r[0], "outcome"), "DELETED");
    assert_eq!(col(&r[0], "affected"), "2");
    let mine = rows(&bob, &format!("SELECT * FROM reservations WHERE user_id = '{bob_id}'")).await;
    assert_eq!(col(&mine[0], "status"), "CONFIRMED");

    // Every step is in the audit trail.
    let audit = rows(&admin, &format!("SELECT * FROM audit_log WHERE entity_id = '{a1}'")).await;
    let actions: Vec<&str> = audit.iter().map(|row| col(row, "action")).collect();
    assert_eq!(actions, vec!["CREATE", "IMPACT", "RESTORE"]);
    let changes: serde_json::Value = serde_json::from_str(col(&audit[1], "changes")).unwrap();
    assert!(changes.as_array().unwrap().iter().any(|c| c["field"] == "status"));
}

#[tokio::test]
async fn cancel_forms_and_conflict_preflight() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    let rid = create_resource(&admin, "Round pen").await;
    create_user(&admin, "carol@paddock.test", "Carol").await;
    let carol = connect(addr, "carol@paddock.test").await;
    let day = future_day();

    let first = Ulid::new();
    let second = Ulid::new();
    rows(&carol, &book_sql(first, rid, day + HOUR, day + 2 * HOUR, false)).await;
    rows(&carol, &book_sql(second, rid, day + 3 * HOUR, day + 4 * HOUR, false)).await;

    let preflight = format!(
        r#"SELECT * FROM conflicts WHERE resource_id = '{rid}' AND start >= {} AND "end" <= {}"#,
        day,
        day + 5 * HOUR
    );
    let r = rows(&carol, &preflight).await;
    assert_eq!(r.len(), 2);
    assert!(r.iter().all(|row| col(row, "kind") == "OVERLAP"));

    let r = rows(
        &carol,
        &format!("INSERT INTO cancellations (reservation_id, reason) VALUES ('{first}', 'Horse is lame')"),
    )
    .await;
    assert_eq!(col(&r[0], "outcome"), "CANCELLED");
    assert_eq!(col(&r[0], "cancel_reason"), "Horse is lame");

    let r = rows(&carol, &format!("DELETE FROM reservations WHERE id = '{second}'")).await;
    assert_eq!(col(&r[0], "cancel_reason"), "Cancelled by user");

    assert!(rows(&carol, &preflight).await.is_empty());
    assert_eq!(
        sqlstate(&carol, &format!("DELETE FROM reservations WHERE id = '{second}'")).await,
        "22023"
    );
}

#[tokio::test]
async fn disable_user_cascades_and_locks_out() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    let rid = create_resource(&admin, "Outdoor ring").await;
    let dave_id = create_user(&admin, "dave@paddock.test", "Dave").await;
    let dave = connect(addr, "dave@paddock.test").await;
    let day = future_day();

    for i in 0..3 {
        rows(&dave, &book_sql(Ulid::new(), rid, day + i * 2 * HOUR, day + (i * 2 + 1) * HOUR, false)).await;
    }

    assert_eq!(sqlstate(&dave, "SELECT * FROM users").await, "42501");

    let r = rows(
        &admin,
        &format!("INSERT INTO user_status (user_id, status, reason) VALUES ('{dave_id}', 'DISABLED', 'Moved barns')"),
    )
    .await;
    assert_eq!(col(&r[0], "outcome"), "DISABLED");
    assert_eq!(col(&r[0], "cancelled_reservations"), "3");

    // Disabled users are refused.
    assert_eq!(
        sqlstate(&dave, &book_sql(Ulid::new(), rid, day + 20 * HOUR, day + 21 * HOUR, false)).await,
        "42501"
    );

    let again = format!("INSERT INTO user_status (user_id, status) VALUES ('{dave_id}', 'DISABLED')");
    assert_eq!(sqlstate(&admin, &again).await, "22023");

    let r = rows(
        &admin,
        &format!("INSERT INTO user_status (user_id, status) VALUES ('{dave_id}', 'ACTIVE')"),
    )
    .await;
    assert_eq!(col(&r[0], "outcome"), "ENABLED");
    let mine = rows(&dave, &format!("SELECT * FROM reservations WHERE user_id = '{dave_id}'")).await;
    assert!(mine.iter().all(|row| col(row, "status") == "CANCELLED"));
}

#[tokio::test]
async fn non_admin_cannot_manage_blocks_or_users() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    let rid = create_resource(&admin, "Hot walker").await;
    create_user(&admin, "erin@paddock.test", "Erin").await;
    let erin = connect(addr, "erin@paddock.test").await;
    let day = future_day();

    let block = format!(
        r#"INSERT INTO blocks (id, resource_id, reason, start, "end") VALUES ('{}', '{rid}', 'Mine now', {}, {})"#,
        Ulid::new(),
        day,
        day + HOUR
    );
    assert_eq!(sqlstate(&erin, &block).await, "42501");
    let user = format!(
        "INSERT INTO users (id, email, name) VALUES ('{}', 'friend@paddock.test', 'Friend')",
        Ulid::new()
    );
    assert_eq!(sqlstate(&erin, &user).await, "42501");
    assert_eq!(sqlstate(&erin, "SELECT * FROM audit_log").await, "42501");
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;

    let rid = Ulid::new().to_string();
    let created = admin
        .query(
            "INSERT INTO resources (id, name) VALUES ($1, $2)",
            &[&rid, &"Wash bay"],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].get::<_, String>("outcome"), "CREATED");
    assert_eq!(created[0].get::<_, String>("name"), "Wash bay");

    let listed = admin.query("SELECT * FROM resources", &[]).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get::<_, String>("id"), rid);

    // Numbers travel as text parameters and are bound unquoted.
    let day = future_day().to_string();
    let end = (future_day() + HOUR).to_string();
    let reservation = Ulid::new().to_string();
    let booked = admin
        .query(
            r#"INSERT INTO reservations (id, resource_id, start, "end", purpose) VALUES ($1, $2, $3, $4, $5)"#,
            &[&reservation, &rid, &day, &end, &"LESSON"],
        )
        .await
        .unwrap();
    assert_eq!(booked[0].get::<_, String>("outcome"), "CREATED");
    assert_eq!(booked[0].get::<_, String>("purpose"), "LESSON");
}
