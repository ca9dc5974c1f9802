use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{NaiveDate, NaiveTime};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use booking_flow_cell::{BookingSession, BookingStep, FlowError, FlowNotice};
use shared_models::{DateWindow, Scope, ScopeKind};
use shared_utils::{
    MockSchedulingResponses, PushFrames, ScriptedTransport, SessionHandle, TestConfig,
};

fn d1() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
}

fn t9() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap()
}

fn t10() -> NaiveTime {
    NaiveTime::from_hms_opt(10, 0, 0).unwrap()
}

fn p1() -> Uuid {
    Uuid::from_u128(1)
}

fn p2() -> Uuid {
    Uuid::from_u128(2)
}

fn specialty() -> Uuid {
    Uuid::from_u128(10)
}

fn test_scope() -> Scope {
    Scope {
        kind: ScopeKind::Specialty,
        id: specialty(),
        window: DateWindow {
            from: d1(),
            to: NaiveDate::from_ymd_opt(2025, 6, 8).unwrap(),
        },
    }
}

struct Flow {
    session: BookingSession,
    transport: Arc<ScriptedTransport>,
    push: SessionHandle,
}

/// A session connected over a scripted push transport, talking to the
/// wiremock scheduling API.
async fn start_flow(server: &MockServer) -> Flow {
    let transport = ScriptedTransport::new();
    let push = transport.expect_session();
    let config = TestConfig::with_api_url(server.uri()).to_app_config();
    let session = BookingSession::with_transport(&config, transport.clone());
    session.connect().await.expect("push channel connects");
    Flow {
        session,
        transport,
        push,
    }
}

/// Availability for the whole window: one day (`d1`), slots as given.
async fn mount_window(server: &MockServer, slots: &[(NaiveTime, Uuid)]) {
    Mock::given(method("GET"))
        .and(path("/scheduling/availability"))
        .and(query_param("date_to", "2025-06-08"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            MockSchedulingResponses::availability_day(d1(), slots)
        ])))
        .mount(server)
        .await;
}

/// Single-day fetches for `d1`: the slot list select_date loads, and every
/// later refetch of that day.
async fn mount_day(server: &MockServer, slots: &[(NaiveTime, Uuid)]) {
    Mock::given(method("GET"))
        .and(path("/scheduling/availability"))
        .and(query_param("date_to", "2025-06-02"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            MockSchedulingResponses::availability_day(d1(), slots)
        ])))
        .mount(server)
        .await;
}

/// Answer only the first single-day fetch with this list; mount before a
/// plain `mount_day` carrying the post-change list.
async fn mount_day_once(server: &MockServer, slots: &[(NaiveTime, Uuid)]) {
    Mock::given(method("GET"))
        .and(path("/scheduling/availability"))
        .and(query_param("date_to", "2025-06-02"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            MockSchedulingResponses::availability_day(d1(), slots)
        ])))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

async fn mount_reserve(server: &MockServer, grant_id: Uuid, ttl_seconds: i64) {
    Mock::given(method("POST"))
        .and(path("/scheduling/reservations"))
        .respond_with(ResponseTemplate::new(201).set_body_json(
            MockSchedulingResponses::reservation_grant(grant_id, ttl_seconds),
        ))
        .mount(server)
        .await;
}

async fn mount_delete(server: &MockServer) {
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

async fn mount_booking(server: &MockServer, appointment_id: Uuid) {
    Mock::given(method("POST"))
        .and(path("/scheduling/bookings"))
        .respond_with(ResponseTemplate::new(201).set_body_json(
            MockSchedulingResponses::booking_confirmation(appointment_id),
        ))
        .mount(server)
        .await;
}

async fn advance_to_time_selection(flow: &Flow) {
    flow.session
        .select_scope(test_scope())
        .await
        .expect("scope selects");
    flow.session.select_date(d1()).await.expect("date selects");
    assert_eq!(flow.session.current_step(), BookingStep::TimeSelection);
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached before the polling deadline");
}

async fn expect_notice(rx: &mut broadcast::Receiver<FlowNotice>, wanted: FlowNotice) {
    loop {
        let notice = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("notice within timeout")
            .expect("notice channel open");
        if notice == wanted {
            return;
        }
    }
}

async fn wait_for_delete(server: &MockServer, id: Uuid) {
    let wanted = format!("/scheduling/reservations/{}", id);
    for _ in 0..100 {
        let hit = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .any(|r| r.method.to_string() == "DELETE" && r.url.path() == wanted);
        if hit {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("expected DELETE for reservation {} was never issued", id);
}

async fn availability_fetches(server: &MockServer, date_to: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| {
            r.url.path() == "/scheduling/availability"
                && r.url
                    .query_pairs()
                    .any(|(k, v)| k == "date_to" && v == date_to)
        })
        .count()
}

#[tokio::test]
async fn test_single_professional_flow_runs_to_completion() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1()), (t10(), p1())]).await;
    mount_day(&server, &[(t9(), p1()), (t10(), p1())]).await;
    mount_reserve(&server, Uuid::new_v4(), 180).await;
    let appointment = Uuid::new_v4();
    mount_booking(&server, appointment).await;

    let flow = start_flow(&server).await;
    advance_to_time_selection(&flow).await;
    assert_eq!(flow.session.slots().borrow().len(), 2);

    // One eligible professional: professional selection is skipped.
    flow.session.select_slot(t9()).await.expect("slot reserves");
    assert_eq!(flow.session.current_step(), BookingStep::Confirmation);
    assert!(*flow.session.remaining_seconds().borrow() > 170);

    let confirmation = flow.session.confirm().await.expect("booking confirms");
    assert_eq!(confirmation.appointment_id, appointment);
    assert_eq!(flow.session.current_step(), BookingStep::Completed);
    assert!(flow.session.active_reservation().await.is_none());
    assert_eq!(*flow.session.remaining_seconds().borrow(), 0);
}

#[tokio::test]
async fn test_several_professionals_route_through_selection() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1()), (t9(), p2())]).await;
    mount_day(&server, &[(t9(), p1()), (t9(), p2())]).await;
    mount_reserve(&server, Uuid::new_v4(), 180).await;
    mount_booking(&server, Uuid::new_v4()).await;

    let flow = start_flow(&server).await;
    advance_to_time_selection(&flow).await;

    flow.session.select_slot(t9()).await.expect("slot reserves");
    assert_eq!(
        flow.session.current_step(),
        BookingStep::ProfessionalSelection
    );

    // The hold pins the tentative professional; the real choice lands here.
    flow.session
        .select_professional(p2())
        .await
        .expect("professional from the eligible set");
    flow.session.confirm().await.expect("booking confirms");

    let booked_with_p2 = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .any(|r| {
            r.url.path() == "/scheduling/bookings"
                && serde_json::from_slice::<serde_json::Value>(&r.body)
                    .is_ok_and(|body| body["professional_id"] == serde_json::json!(p2()))
        });
    assert!(booked_with_p2, "booking must carry the chosen professional");
}

#[tokio::test]
async fn test_professional_outside_eligible_set_is_rejected() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1()), (t9(), p2())]).await;
    mount_day(&server, &[(t9(), p1()), (t9(), p2())]).await;
    mount_reserve(&server, Uuid::new_v4(), 180).await;

    let flow = start_flow(&server).await;
    advance_to_time_selection(&flow).await;
    flow.session.select_slot(t9()).await.expect("slot reserves");

    let stranger = Uuid::from_u128(99);
    let result = flow.session.select_professional(stranger).await;
    assert_matches!(result, Err(FlowError::NotEligible(id)) if id == stranger);
    assert_eq!(
        flow.session.current_step(),
        BookingStep::ProfessionalSelection
    );
}

#[tokio::test]
async fn test_conflict_keeps_time_selection_and_refetches_slots() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1())]).await;
    // First day fetch shows the slot; the refetch after the conflict shows
    // it gone to the other session.
    mount_day_once(&server, &[(t9(), p1())]).await;
    mount_day(&server, &[(t10(), p2())]).await;
    Mock::given(method("POST"))
        .and(path("/scheduling/reservations"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let flow = start_flow(&server).await;
    let mut notices = flow.session.notices();
    advance_to_time_selection(&flow).await;

    let result = flow.session.select_slot(t9()).await;
    assert_matches!(result, Err(FlowError::SlotTaken));
    assert_eq!(flow.session.current_step(), BookingStep::TimeSelection);
    expect_notice(&mut notices, FlowNotice::SlotTaken).await;

    // The lost slot is gone from the refreshed list.
    wait_until(|| {
        let slots = flow.session.slots().borrow().clone();
        !slots.is_empty() && slots.iter().all(|slot| slot.time != t9())
    })
    .await;
    assert!(flow.session.active_reservation().await.is_none());
}

#[tokio::test]
async fn test_own_reservation_echo_does_not_remove_the_slot() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1())]).await;
    mount_day(&server, &[(t9(), p1())]).await;
    mount_reserve(&server, Uuid::new_v4(), 180).await;

    let flow = start_flow(&server).await;
    advance_to_time_selection(&flow).await;
    flow.session.select_slot(t9()).await.expect("slot reserves");

    // The server reports our own hold; that is not someone else's action.
    flow.push
        .push_frame(PushFrames::slot_updated(p1(), d1(), t9(), false));
    sleep(Duration::from_millis(200)).await;

    let slots = flow.session.slots().borrow().clone();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].time, t9());
    assert!(slots[0].eligible_professionals.contains(&p1()));
    assert_eq!(flow.session.current_step(), BookingStep::Confirmation);
}

#[tokio::test]
async fn test_competitor_on_another_professional_shrinks_eligibility() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1()), (t9(), p2())]).await;
    mount_day(&server, &[(t9(), p1()), (t9(), p2())]).await;
    mount_reserve(&server, Uuid::new_v4(), 180).await;

    let flow = start_flow(&server).await;
    advance_to_time_selection(&flow).await;
    // Tentative professional is p1 (lowest id); p2 goes to someone else.
    flow.session.select_slot(t9()).await.expect("slot reserves");

    flow.push
        .push_frame(PushFrames::slot_updated(p2(), d1(), t9(), false));

    wait_until(|| {
        let slots = flow.session.slots().borrow().clone();
        slots.len() == 1
            && slots[0].eligible_professionals.len() == 1
            && slots[0].eligible_professionals.contains(&p1())
    })
    .await;
    // The slot survives through p1 and the flow is not interrupted.
    assert_eq!(
        flow.session.current_step(),
        BookingStep::ProfessionalSelection
    );
}

#[tokio::test]
async fn test_expired_hold_returns_to_time_selection_with_fresh_slots() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1())]).await;
    mount_day_once(&server, &[(t9(), p1())]).await;
    mount_day(&server, &[(t10(), p1())]).await;
    mount_reserve(&server, Uuid::new_v4(), 1).await;

    let flow = start_flow(&server).await;
    let mut notices = flow.session.notices();
    advance_to_time_selection(&flow).await;
    flow.session.select_slot(t9()).await.expect("slot reserves");
    assert_eq!(flow.session.current_step(), BookingStep::Confirmation);

    expect_notice(&mut notices, FlowNotice::ReservationExpired).await;
    wait_until(|| flow.session.current_step() == BookingStep::TimeSelection).await;
    assert!(flow.session.active_reservation().await.is_none());

    // The expired hold's slot list was refetched.
    wait_until(|| {
        flow.session
            .slots()
            .borrow()
            .iter()
            .any(|slot| slot.time == t10())
    })
    .await;
}

#[tokio::test]
async fn test_scope_losing_availability_interrupts_the_flow() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1())]).await;
    mount_day(&server, &[(t9(), p1())]).await;

    let flow = start_flow(&server).await;
    let mut notices = flow.session.notices();
    advance_to_time_selection(&flow).await;

    flow.push
        .push_frame(PushFrames::scope_availability_updated(specialty(), false));

    expect_notice(&mut notices, FlowNotice::ScopeUnavailable).await;
    wait_until(|| flow.session.current_step() == BookingStep::ScopeSelection).await;
    assert!(flow.session.days().borrow().is_empty());

    // The scope's push group is left along with it.
    let group = test_scope().group_key();
    wait_until(|| {
        flow.push
            .sent_messages()
            .iter()
            .any(|raw| raw.contains("LeaveScopeGroup") && raw.contains(&group))
    })
    .await;
}

#[tokio::test]
async fn test_day_delta_underflow_realigns_from_a_fetch() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1()), (t10(), p1())]).await;
    mount_day(&server, &[(t9(), p1())]).await;

    let flow = start_flow(&server).await;
    flow.session
        .select_scope(test_scope())
        .await
        .expect("scope selects");
    let initial = flow
        .session
        .days()
        .borrow()
        .iter()
        .find(|day| day.date == d1())
        .map(|day| day.slot_count);
    assert_eq!(initial, Some(2));

    // An impossible delta: the local count has drifted, trust the fetch.
    flow.push.push_frame(PushFrames::day_updated(d1(), -5));

    wait_until(|| {
        flow.session
            .days()
            .borrow()
            .iter()
            .any(|day| day.date == d1() && day.slot_count == 1 && day.available)
    })
    .await;
}

#[tokio::test]
async fn test_block_on_selected_date_steps_back_with_notice() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1())]).await;
    mount_day_once(&server, &[(t9(), p1())]).await;
    mount_day(&server, &[]).await;

    let flow = start_flow(&server).await;
    let mut notices = flow.session.notices();
    advance_to_time_selection(&flow).await;

    flow.push
        .push_frame(PushFrames::block_range_changed(p1(), d1(), d1(), true));

    expect_notice(&mut notices, FlowNotice::DateBlocked { date: d1() }).await;
    wait_until(|| flow.session.current_step() == BookingStep::DateSelection).await;
    assert!(flow.session.slots().borrow().is_empty());

    // The blocked day is re-derived from the fetch and reads unavailable.
    wait_until(|| {
        flow.session
            .days()
            .borrow()
            .iter()
            .any(|day| day.date == d1() && !day.available)
    })
    .await;
}

#[tokio::test]
async fn test_stale_scope_response_is_discarded() {
    let server = MockServer::start().await;
    let other_specialty = Uuid::from_u128(11);
    let other_day = NaiveDate::from_ymd_opt(2025, 6, 3).unwrap();

    // The first pick answers slowly; the second instantly.
    Mock::given(method("GET"))
        .and(path("/scheduling/availability"))
        .and(query_param("specialty_id", specialty().to_string()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!([
                    MockSchedulingResponses::availability_day(d1(), &[(t9(), p1())])
                ]))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/scheduling/availability"))
        .and(query_param("specialty_id", other_specialty.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            MockSchedulingResponses::availability_day(other_day, &[(t10(), p2())])
        ])))
        .mount(&server)
        .await;

    let flow = start_flow(&server).await;
    let session = Arc::new(flow.session);

    let slow = Arc::clone(&session);
    let slow_task = tokio::spawn(async move { slow.select_scope(test_scope()).await });
    sleep(Duration::from_millis(50)).await;

    let newer_scope = Scope {
        kind: ScopeKind::Specialty,
        id: other_specialty,
        window: DateWindow {
            from: other_day,
            to: NaiveDate::from_ymd_opt(2025, 6, 8).unwrap(),
        },
    };
    session
        .select_scope(newer_scope)
        .await
        .expect("newer scope selects");
    slow_task
        .await
        .expect("select task must not panic")
        .expect("stale select resolves quietly");

    // The slow response must not overwrite the newer scope's calendar.
    let days = session.days().borrow().clone();
    assert!(days.iter().any(|day| day.date == other_day && day.available));
    assert!(days.iter().all(|day| day.date != d1()));
    assert_eq!(session.current_step(), BookingStep::DateSelection);
}

#[tokio::test]
async fn test_booking_failure_repairs_suppressed_events_with_a_refetch() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1())]).await;
    mount_day(&server, &[(t9(), p1())]).await;
    mount_reserve(&server, Uuid::new_v4(), 180).await;
    Mock::given(method("POST"))
        .and(path("/scheduling/bookings"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let flow = start_flow(&server).await;
    advance_to_time_selection(&flow).await;
    flow.session.select_slot(t9()).await.expect("slot reserves");

    let push = flow.push;
    let session = Arc::new(flow.session);
    let confirming = Arc::clone(&session);
    let confirm_task = tokio::spawn(async move { confirming.confirm().await });

    // A competitor's event lands while the booking call is in flight; the
    // flicker guard drops it instead of moving the view.
    sleep(Duration::from_millis(100)).await;
    push.push_frame(PushFrames::day_updated(d1(), -1));

    let result = confirm_task.await.expect("confirm task must not panic");
    assert_matches!(result, Err(FlowError::Api(_)));
    assert_eq!(session.current_step(), BookingStep::Confirmation);

    // The dropped event is subsumed by a repair refetch of the window.
    assert!(availability_fetches(&server, "2025-06-08").await >= 2);
    assert!(session
        .days()
        .borrow()
        .iter()
        .any(|day| day.date == d1() && day.available));
}

#[tokio::test]
async fn test_going_back_releases_the_hold_and_refreshes_slots() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1()), (t9(), p2())]).await;
    mount_day_once(&server, &[(t9(), p1()), (t9(), p2())]).await;
    mount_day(&server, &[(t9(), p2())]).await;
    let grant_id = Uuid::new_v4();
    mount_reserve(&server, grant_id, 180).await;
    mount_delete(&server).await;

    let flow = start_flow(&server).await;
    advance_to_time_selection(&flow).await;
    flow.session.select_slot(t9()).await.expect("slot reserves");
    assert_eq!(
        flow.session.current_step(),
        BookingStep::ProfessionalSelection
    );

    let back_to = flow.session.go_back().await.expect("step back");
    assert_eq!(back_to, BookingStep::TimeSelection);
    assert!(flow.session.active_reservation().await.is_none());
    wait_for_delete(&server, grant_id).await;
    assert!(availability_fetches(&server, "2025-06-02").await >= 2);
}

#[tokio::test]
async fn test_closing_the_session_releases_best_effort_and_cancels() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1())]).await;
    mount_day(&server, &[(t9(), p1())]).await;
    let grant_id = Uuid::new_v4();
    mount_reserve(&server, grant_id, 180).await;
    mount_delete(&server).await;

    let flow = start_flow(&server).await;
    advance_to_time_selection(&flow).await;
    flow.session.select_slot(t9()).await.expect("slot reserves");

    flow.session.close().await;

    assert_eq!(flow.session.current_step(), BookingStep::Cancelled);
    wait_for_delete(&server, grant_id).await;
    assert!(!flow.session.connection().borrow().is_connected());
}

#[tokio::test]
async fn test_reconnect_refetches_the_window_and_notifies() {
    let server = MockServer::start().await;
    mount_window(&server, &[(t9(), p1())]).await;

    let flow = start_flow(&server).await;
    let mut notices = flow.session.notices();
    flow.session
        .select_scope(test_scope())
        .await
        .expect("scope selects");

    // Server drops the connection; the reconnect stalls until the next
    // scripted session is planned, so the loss is observable.
    flow.push.close();
    expect_notice(&mut notices, FlowNotice::ConnectionLost).await;

    // Now the reconnect goes through and rejoins the scope group before
    // reporting Connected.
    let second = flow.transport.expect_session();
    expect_notice(&mut notices, FlowNotice::ConnectionRestored).await;

    let group = test_scope().group_key();
    wait_until(|| {
        second
            .sent_messages()
            .iter()
            .any(|raw| raw.contains("JoinScopeGroup") && raw.contains(&group))
    })
    .await;

    // Events missed while disconnected are covered by a fresh window fetch.
    wait_until_window_refetched(&server).await;
}

async fn wait_until_window_refetched(server: &MockServer) {
    for _ in 0..100 {
        if availability_fetches(server, "2025-06-08").await >= 2 {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("expected a second window fetch after reconnect");
}
