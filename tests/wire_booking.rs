use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use tabletime::engine::{Engine, EngineConfig};
use tabletime::notify::NotifyHub;
use tabletime::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tabletime_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(
        Engine::new(dir.join("tabletime.wal"), hub.clone(), EngineConfig::default()).unwrap(),
    );

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            let hub = hub.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, hub, "tabletime".to_string(), None)
                    .await;
            });
        }
    });

    (addr, engine)
}

async fn connect(
    addr: SocketAddr,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("tabletime")
        .user("tabletime")
        .password("tabletime");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

/// Wait for a notification with timeout.
async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<tokio_postgres::SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn future_date() -> NaiveDate {
    Utc::now().date_naive() + Days::new(10)
}

struct Fixture {
    room: Ulid,
    campaign: Ulid,
    user: Ulid,
    date: NaiveDate,
}

/// One physical room, one 3h campaign in it, one user.
async fn seed(client: &tokio_postgres::Client) -> Fixture {
    let (room, campaign, user) = (Ulid::new(), Ulid::new(), Ulid::new());
    client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, name, type, capacity) VALUES ('{room}', 'Table 1', 'physical', 6);
             INSERT INTO campaigns (id, title, level, max_players, duration_hours, working_hours_start, working_hours_end)
                 VALUES ('{campaign}', 'Curse of Strahd', 3, 4, 3, '10:00', '22:00');
             INSERT INTO campaign_rooms (campaign_id, room_id) VALUES ('{campaign}', '{room}');
             INSERT INTO users (id, name) VALUES ('{user}', 'Ann');"
        ))
        .await
        .unwrap();
    Fixture {
        room,
        campaign,
        user,
        date: future_date(),
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_and_list_over_the_wire() {
    let (addr, engine) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let f = seed(&client).await;

    let booking = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, user_id, campaign_id, start_time, players_count) \
             VALUES ('{booking}', '{}', '{}', '{}T18:00:00Z', 2)",
            f.user, f.campaign, f.date
        ))
        .await
        .unwrap();

    let mine = rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE user_id = '{}'", f.user))
            .await
            .unwrap(),
    );
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("id"), Some(booking.to_string().as_str()));
    assert_eq!(mine[0].get("campaign_title"), Some("Curse of Strahd"));
    assert_eq!(mine[0].get("players_count"), Some("2"));

    let slots = rows(
        client
            .simple_query(&format!("SELECT * FROM slots WHERE campaign_id = '{}'", f.campaign))
            .await
            .unwrap(),
    );
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].get("available_seats"), Some("2"));

    assert_eq!(engine.list_user_bookings(&f.user).await.unwrap().len(), 1);
    assert!(engine.get_room(&f.room).is_ok());
}

#[tokio::test]
async fn available_times_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let f = seed(&client).await;

    let times = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM available_times WHERE campaign_id = '{}' AND \"date\" = '{}'",
                f.campaign, f.date
            ))
            .await
            .unwrap(),
    );
    // Hourly from 10:00 to 19:00 inclusive.
    assert_eq!(times.len(), 10);
    assert_eq!(
        times[0].get("start_time"),
        Some(format!("{}T10:00:00Z", f.date).as_str())
    );
    assert_eq!(times[0].get("available"), Some("t"));
}

#[tokio::test]
async fn engine_errors_carry_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let f = seed(&client).await;

    let other = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO campaigns (id, title, level, max_players, duration_hours, working_hours_start, working_hours_end)
                 VALUES ('{other}', 'Tomb of Annihilation', 5, 4, 2, '10:00', '22:00');
             INSERT INTO campaign_rooms (campaign_id, room_id) VALUES ('{other}', '{}');",
            f.room
        ))
        .await
        .unwrap();

    client
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES ('{}', '{}', '{}', '{}T18:00:00', 1)",
            Ulid::new(),
            f.user,
            f.campaign,
            f.date
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES ('{}', '{}', '{other}', '{}T19:00:00', 1)",
            Ulid::new(),
            f.user,
            f.date
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("23P01"));

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES ('{}', '{}', '{}', '{}T12:00:00', 5)",
            Ulid::new(),
            f.user,
            f.campaign,
            f.date
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("53400"));

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES ('{}', '{}', '{}', '{}T20:00:00', 1)",
            Ulid::new(),
            f.user,
            f.campaign,
            f.date
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("22023"));

    let err = client
        .batch_execute(&format!(
            "DELETE FROM bookings WHERE id = '{}' AND user_id = '{}'",
            Ulid::new(),
            f.user
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("P0002"));

    let err = client
        .batch_execute("INSERT INTO bookings VALUES ('not-a-ulid')")
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("42601"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, engine) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let f = seed(&client).await;

    let booking = Ulid::new().to_string();
    let user = f.user.to_string();
    let campaign = f.campaign.to_string();
    let start = format!("{}T14:00:00Z", f.date);
    let players = "3".to_string();
    client
        .execute(
            "INSERT INTO bookings (id, user_id, campaign_id, start_time, players_count) VALUES ($1, $2, $3, $4, $5)",
            &[&booking, &user, &campaign, &start, &players],
        )
        .await
        .unwrap();

    let mine = engine.list_user_bookings(&f.user).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].players_count, 3);
}

#[tokio::test]
async fn listen_delivers_booking_notices() {
    let (addr, _engine) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let f = seed(&listener).await;

    listener
        .batch_execute(&format!("LISTEN campaign_{}", f.campaign))
        .await
        .unwrap();

    let (booker, _) = connect(addr).await;
    let booking = Ulid::new();
    booker
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES ('{booking}', '{}', '{}', '{}T12:00:00Z', 1)",
            f.user, f.campaign, f.date
        ))
        .await
        .unwrap();

    // Pending notices go out ahead of the listener's next response.
    listener.simple_query("SELECT * FROM campaigns").await.unwrap();

    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("campaign_{}", f.campaign));
    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(payload["kind"], "booking_confirmed");
    assert_eq!(payload["booking_id"], booking.to_string());
    assert_eq!(payload["campaign_title"], "Curse of Strahd");
}

#[tokio::test]
async fn unlisten_stops_notices() {
    let (addr, _engine) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let f = seed(&listener).await;

    listener.batch_execute("LISTEN bookings").await.unwrap();
    listener.batch_execute("UNLISTEN *").await.unwrap();

    listener
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES ('{}', '{}', '{}', '{}T12:00:00Z', 1)",
            Ulid::new(),
            f.user,
            f.campaign,
            f.date
        ))
        .await
        .unwrap();
    listener.simple_query("SELECT * FROM rooms").await.unwrap();

    assert!(recv_notification(&mut rx, Duration::from_millis(200))
        .await
        .is_none());
}

#[tokio::test]
async fn deactivated_campaign_is_listed_inactive() {
    let (addr, _engine) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let f = seed(&client).await;

    client
        .batch_execute(&format!("DELETE FROM campaigns WHERE id = '{}'", f.campaign))
        .await
        .unwrap();

    let campaigns = rows(client.simple_query("SELECT * FROM campaigns").await.unwrap());
    assert_eq!(campaigns.len(), 1);
    assert_eq!(campaigns[0].get("is_active"), Some("f"));
}
