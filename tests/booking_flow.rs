use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use roomd::catalog::Seed;
use roomd::engine::{Engine, EngineConfig};
use roomd::lifecycle::{BookingService, ServiceSettings};
use roomd::notify::NotifyHub;
use roomd::policy::RolePolicy;
use roomd::wire;

const HALL: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
const LAB: &str = "01ARZ3NDEKTSV4RRFFQ69G5FB0";
const STUDENT_1: &str = "01BX5ZZKBKACTAV9WEVGEMMVS1";
const STUDENT_2: &str = "01BX5ZZKBKACTAV9WEVGEMMVS2";
const STAFF: &str = "01BX5ZZKBKACTAV9WEVGEMMVS3";
const ADMIN: &str = "01BX5ZZKBKACTAV9WEVGEMMVS4";

/// 2100-01-01T00:00Z
const DAY0: i64 = 4_102_444_800_000;
const HOUR: i64 = 3_600_000;

fn seed_json() -> String {
    let building = Ulid::new();
    format!(
        r#"{{
        "locations": [
            {{ "id": "{HALL}", "name": "Hall A", "resource_type": "regular",
               "block_id": "{building}", "floor_id": "{building}", "building_id": "{building}" }},
            {{ "id": "{LAB}", "name": "Chem Lab", "resource_type": "lab", "capacity": 24,
               "block_id": "{building}", "floor_id": "{building}", "building_id": "{building}" }}
        ],
        "users": [
            {{ "id": "{STUDENT_1}", "role": "student" }},
            {{ "id": "{STUDENT_2}", "role": "student" }},
            {{ "id": "{STAFF}", "role": "staff" }},
            {{ "id": "{ADMIN}", "role": "admin" }}
        ]
    }}"#
    )
}

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roomd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let (catalog, directory) = Seed::from_json(&seed_json()).unwrap().into_parts();
    let engine = Arc::new(
        Engine::new(dir.join("bookings.wal"), Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap(),
    );
    let service = Arc::new(BookingService::new(
        engine,
        Arc::new(catalog),
        Arc::new(directory),
        Arc::new(RolePolicy),
        ServiceSettings::default(),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let service = service.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, service, "roomd".to_string(), None).await;
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
        .dbname("campus")
        .user("roomd")
        .password("roomd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(connection);
    client
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().expect("database error").code().to_string()
}

fn insert_booking(id: Ulid, location: &str, user: &str, start: i64, end: i64, purpose: &str) -> String {
    format!(
        r#"INSERT INTO bookings (id, location_id, user_id, start, "end", purpose) VALUES ('{id}', '{location}', '{user}', {start}, {end}, '{purpose}')"#
    )
}

fn conflicts_sql(location: &str, start: i64, end: i64) -> String {
    format!(r#"SELECT * FROM conflicts WHERE location_id = '{location}' AND start >= {start} AND "end" <= {end}"#)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn request_conflict_approve_reject() {
    let addr = start_test_server().await;
    let student = connect(addr).await;
    let admin = connect(addr).await;

    let first = Ulid::new();
    student
        .batch_execute(&insert_booking(first, HALL, STUDENT_1, DAY0 + 9 * HOUR, DAY0 + 10 * HOUR, "Study group"))
        .await
        .unwrap();

    // A second student overlapping the pending booking is refused.
    let code = sqlstate(
        &student,
        &insert_booking(Ulid::new(), HALL, STUDENT_2, DAY0 + 9 * HOUR + HOUR / 2, DAY0 + 11 * HOUR, "Club"),
    )
    .await;
    assert_eq!(code, "23P01");

    // Touching end-to-start is fine.
    let second = Ulid::new();
    student
        .batch_execute(&insert_booking(second, HALL, STUDENT_2, DAY0 + 10 * HOUR, DAY0 + 11 * HOUR, "Club"))
        .await
        .unwrap();

    let blockers = rows(&admin, &conflicts_sql(HALL, DAY0 + 9 * HOUR, DAY0 + 11 * HOUR)).await;
    assert_eq!(blockers.len(), 2);

    // Students cannot resolve bookings.
    let code = sqlstate(
        &student,
        &format!("INSERT INTO approvals (booking_id, admin_id) VALUES ('{first}', '{STUDENT_1}')"),
    )
    .await;
    assert_eq!(code, "42501");

    admin
        .batch_execute(&format!("INSERT INTO approvals (booking_id, admin_id) VALUES ('{first}', '{ADMIN}')"))
        .await
        .unwrap();
    let code = sqlstate(
        &admin,
        &format!("INSERT INTO approvals (booking_id, admin_id) VALUES ('{first}', '{ADMIN}')"),
    )
    .await;
    assert_eq!(code, "55000");

    admin
        .batch_execute(&format!(
            "INSERT INTO rejections (booking_id, admin_id, reason) VALUES ('{second}', '{ADMIN}', 'exam week')"
        ))
        .await
        .unwrap();

    // The rejected booking no longer blocks anything.
    let blockers = rows(&admin, &conflicts_sql(HALL, DAY0 + 9 * HOUR, DAY0 + 11 * HOUR)).await;
    assert_eq!(blockers.len(), 1);
    assert_eq!(blockers[0].get("id"), Some(first.to_string().as_str()));
    assert_eq!(blockers[0].get("status"), Some("approved"));

    let rejected = rows(&student, &format!("SELECT * FROM bookings WHERE id = '{second}'")).await;
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].get("status"), Some("rejected"));
    assert_eq!(rejected[0].get("rejection_reason"), Some("exam week"));
    assert_eq!(rejected[0].get("resolved_by"), Some(ADMIN));
}

#[tokio::test]
async fn availability_lists_free_slots() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(&insert_booking(Ulid::new(), HALL, STUDENT_1, DAY0 + 9 * HOUR, DAY0 + 10 * HOUR, "Seminar"))
        .await
        .unwrap();

    let free = rows(
        &client,
        &format!(
            r#"SELECT * FROM availability WHERE location_id = '{HALL}' AND start >= {} AND "end" <= {}"#,
            DAY0 + 8 * HOUR,
            DAY0 + 12 * HOUR
        ),
    )
    .await;
    let spans: Vec<(String, String)> = free
        .iter()
        .map(|r| (r.get("start").unwrap().to_string(), r.get("end").unwrap().to_string()))
        .collect();
    assert_eq!(
        spans,
        vec![
            ((DAY0 + 8 * HOUR).to_string(), (DAY0 + 9 * HOUR).to_string()),
            ((DAY0 + 10 * HOUR).to_string(), (DAY0 + 12 * HOUR).to_string()),
        ]
    );

    // Business hours default to 08:00-18:00.
    let slots = rows(&client, &format!("SELECT * FROM slots WHERE location_id = '{HALL}' AND day = {DAY0}")).await;
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[1].get("end"), Some((DAY0 + 18 * HOUR).to_string().as_str()));
}

#[tokio::test]
async fn role_gates_and_error_codes() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let code = sqlstate(
        &client,
        &insert_booking(Ulid::new(), LAB, STUDENT_1, DAY0 + 9 * HOUR, DAY0 + 10 * HOUR, "Titration"),
    )
    .await;
    assert_eq!(code, "42501");

    client
        .batch_execute(&insert_booking(Ulid::new(), LAB, STAFF, DAY0 + 9 * HOUR, DAY0 + 10 * HOUR, "Titration"))
        .await
        .unwrap();

    let types = rows(&client, &format!("SELECT * FROM resource_types WHERE user_id = '{STAFF}'")).await;
    let types: Vec<&str> = types.iter().filter_map(|r| r.get("resource_type")).collect();
    assert_eq!(types, vec!["regular", "lab"]);

    let code = sqlstate(
        &client,
        &insert_booking(Ulid::new(), HALL, STUDENT_1, DAY0 + 10 * HOUR, DAY0 + 9 * HOUR, "Backwards"),
    )
    .await;
    assert_eq!(code, "22023");

    let code = sqlstate(
        &client,
        &format!("INSERT INTO approvals (booking_id, admin_id) VALUES ('{}', '{ADMIN}')", Ulid::new()),
    )
    .await;
    assert_eq!(code, "P0002");

    let code = sqlstate(&client, "DROP TABLE bookings").await;
    assert_eq!(code, "42601");
}

#[tokio::test]
async fn attendees_against_capacity() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let insert = |id: Ulid, attendees: u32| {
        format!(
            r#"INSERT INTO bookings (id, location_id, user_id, start, "end", purpose, attendees, contact) VALUES ('{id}', '{LAB}', '{STAFF}', {}, {}, 'Practical', {attendees}, 'lab-office@campus.example')"#,
            DAY0 + 9 * HOUR,
            DAY0 + 10 * HOUR
        )
    };

    assert_eq!(sqlstate(&client, &insert(Ulid::new(), 25)).await, "22023");
    assert_eq!(sqlstate(&client, &insert(Ulid::new(), 0)).await, "22023");

    let id = Ulid::new();
    client.batch_execute(&insert(id, 24)).await.unwrap();
    let found = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(found[0].get("attendees"), Some("24"));
    assert_eq!(found[0].get("contact"), Some("lab-office@campus.example"));

    // Without the optional columns a request counts one person.
    let solo = Ulid::new();
    client
        .batch_execute(&insert_booking(solo, HALL, STUDENT_1, DAY0 + 9 * HOUR, DAY0 + 10 * HOUR, "Solo"))
        .await
        .unwrap();
    let found = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{solo}'")).await;
    assert_eq!(found[0].get("attendees"), Some("1"));
    assert_eq!(found[0].get("contact"), None);
}

#[tokio::test]
async fn pending_and_user_listings() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let mine = Ulid::new();
    client
        .batch_execute(&insert_booking(mine, HALL, STUDENT_1, DAY0 + 9 * HOUR, DAY0 + 10 * HOUR, "Mine"))
        .await
        .unwrap();
    client
        .batch_execute(&insert_booking(Ulid::new(), HALL, STUDENT_2, DAY0 + 11 * HOUR, DAY0 + 12 * HOUR, "Theirs"))
        .await
        .unwrap();

    let pending = rows(&client, "SELECT * FROM bookings WHERE status = 'pending'").await;
    assert_eq!(pending.len(), 2);

    let own = rows(&client, &format!("SELECT * FROM bookings WHERE user_id = '{STUDENT_1}'")).await;
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].get("id"), Some(mine.to_string().as_str()));

    client
        .batch_execute(&format!("INSERT INTO cancellations (booking_id, user_id) VALUES ('{mine}', '{STUDENT_1}')"))
        .await
        .unwrap();
    let pending = rows(&client, "SELECT * FROM bookings WHERE status = 'pending'").await;
    assert_eq!(pending.len(), 1);
    let cancelled = rows(&client, "SELECT * FROM bookings WHERE status = 'cancelled'").await;
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].get("id"), Some(mine.to_string().as_str()));
    assert!(rows(&client, "SELECT * FROM bookings WHERE status = 'approved'").await.is_empty());
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new().to_string();
    client
        .execute(
            r#"INSERT INTO bookings (id, location_id, user_id, start, "end", purpose) VALUES ($1, $2, $3, $4, $5, $6)"#,
            &[
                &id,
                &HALL,
                &STUDENT_1,
                &(DAY0 + 9 * HOUR).to_string(),
                &(DAY0 + 10 * HOUR).to_string(),
                &"Reading group",
            ],
        )
        .await
        .unwrap();

    let found = client
        .query("SELECT * FROM bookings WHERE id = $1", &[&id])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let status: &str = found[0].get("status");
    assert_eq!(status, "pending");

    // Bound text that looks like SQL or a placeholder is stored verbatim.
    let tricky = Ulid::new().to_string();
    client
        .execute(
            r#"INSERT INTO bookings (id, location_id, user_id, start, "end", purpose) VALUES ($1, $2, $3, $4, $5, $6)"#,
            &[
                &tricky,
                &HALL,
                &STUDENT_2,
                &(DAY0 + 11 * HOUR).to_string(),
                &(DAY0 + 12 * HOUR).to_string(),
                &"pay $1 fee 'now'",
            ],
        )
        .await
        .unwrap();
    let found = client
        .query("SELECT * FROM bookings WHERE id = $1", &[&tricky])
        .await
        .unwrap();
    let purpose: &str = found[0].get("purpose");
    assert_eq!(purpose, "pay $1 fee 'now'");
}
