//! End-to-end call flows over real loopback UDP with compressed timers.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use sip_dialog::{DialogError, DialogState};
use sip_observe::CounterStackMetrics;
use sip_party::StackConfig;
use sip_testkit::{malformed_invite_datagram, test_timers, Agent, TEST_T1};

const WAIT: Duration = Duration::from_secs(5);

fn confirmed(s: &DialogState) -> bool {
    *s == DialogState::Confirmed
}

fn terminated(s: &DialogState) -> bool {
    *s == DialogState::Terminated
}

/// Basic call: INVITE / 100,180,200 / ACK, then BYE / 200.
#[tokio::test]
async fn basic_call_confirms_then_terminates() {
    let a = Agent::spawn("alice").await.unwrap();
    let b = Agent::spawn("bob").await.unwrap();

    let caller_dialog = a.party.invite(&b.contact_uri()).await.unwrap();
    let callee_dialog = b.delegate.next_invite(WAIT).await.expect("inbound INVITE");
    assert!(!callee_dialog.is_uac());

    b.party.accept(&callee_dialog).await.unwrap();

    caller_dialog.wait_for_state(confirmed, WAIT).await.unwrap();
    callee_dialog.wait_for_state(confirmed, WAIT).await.unwrap();

    // Both sides agree on the dialog identifier, tags swapped.
    let a_id = caller_dialog.id().unwrap();
    let b_id = callee_dialog.id().unwrap();
    assert_eq!(a_id.call_id, b_id.call_id);
    assert_eq!(a_id.local_tag, b_id.remote_tag);
    assert_eq!(a_id.remote_tag, b_id.local_tag);

    a.party.hangup(&caller_dialog).await.unwrap();
    caller_dialog.wait_for_state(terminated, WAIT).await.unwrap();
    callee_dialog.wait_for_state(terminated, WAIT).await.unwrap();

    assert_eq!(caller_dialog.last_error(), None);
    assert_eq!(callee_dialog.last_error(), None);
}

/// Dropping the first INVITE datagram: the retransmission (identical bytes)
/// carries the call through.
#[tokio::test]
async fn lossy_invite_is_retransmitted_identically() {
    let dropped: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
    let replayed: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));

    let filter = {
        let dropped = dropped.clone();
        let replayed = replayed.clone();
        move |_ctx: &sip_transaction::TransportContext, payload: &Bytes| {
            if payload.starts_with(b"INVITE ") {
                let mut first = dropped.lock();
                if first.is_none() {
                    *first = Some(payload.clone());
                    return false; // lose the first INVITE
                }
                let mut second = replayed.lock();
                if second.is_none() {
                    *second = Some(payload.clone());
                }
            }
            true
        }
    };

    let a = Agent::spawn_with(
        "alice",
        StackConfig {
            timers: Some(test_timers()),
            outbound_filter: Some(Arc::new(filter)),
            ..StackConfig::default()
        },
    )
    .await
    .unwrap();
    let b = Agent::spawn("bob").await.unwrap();

    let caller_dialog = a.party.invite(&b.contact_uri()).await.unwrap();
    let callee_dialog = b.delegate.next_invite(WAIT).await.expect("retransmit arrived");
    b.party.accept(&callee_dialog).await.unwrap();
    caller_dialog.wait_for_state(confirmed, WAIT).await.unwrap();

    let first = dropped.lock().clone().expect("first INVITE was seen");
    let second = replayed.lock().clone().expect("second INVITE was seen");
    assert_eq!(first, second, "retransmission must reuse the exact bytes");
}

/// A silent peer: Timer A retransmits until Timer B ends the transaction
/// and the dialog surfaces a structured timeout.
#[tokio::test]
async fn silent_peer_times_out_after_64_t1() {
    let sends = Arc::new(AtomicUsize::new(0));
    let counter = sends.clone();
    let filter = move |_ctx: &sip_transaction::TransportContext, payload: &Bytes| {
        if payload.starts_with(b"INVITE ") {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        true
    };

    let a = Agent::spawn_with(
        "alice",
        StackConfig {
            timers: Some(test_timers()),
            outbound_filter: Some(Arc::new(filter)),
            ..StackConfig::default()
        },
    )
    .await
    .unwrap();

    // Bound but never reads; no stack behind it.
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let target = format!("sip:quiet@127.0.0.1:{}", silent.local_addr().unwrap().port());

    let started = std::time::Instant::now();
    let dialog = a.party.invite(&target).await.unwrap();
    dialog
        .wait_for_state(|s| *s == DialogState::Error, WAIT)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(dialog.last_error(), Some(DialogError::TransactionTimeout));
    // Timer B is 64*T1; allow generous scheduling slack either side.
    assert!(elapsed >= TEST_T1 * 48, "gave up too early: {elapsed:?}");
    assert!(elapsed < TEST_T1 * 200, "gave up too late: {elapsed:?}");

    let total = sends.load(Ordering::SeqCst);
    assert!(total >= 3, "expected retransmissions, saw {total}");
    assert!(total <= 12, "retransmit bound exceeded: {total}");
}

/// CANCEL race: INVITE, 180, CANCEL; the caller sees 487, the callee's
/// ringing dialog terminates, and the CANCEL itself gets its 200.
#[tokio::test]
async fn cancel_after_ringing_terminates_both_sides() {
    let a = Agent::spawn("alice").await.unwrap();
    let b = Agent::spawn("bob").await.unwrap();

    let caller_dialog = a.party.invite(&b.contact_uri()).await.unwrap();
    let callee_dialog = b.delegate.next_invite(WAIT).await.expect("inbound INVITE");

    // The 180 must have arrived before we cancel.
    caller_dialog
        .wait_for_state(|s| *s == DialogState::Early, WAIT)
        .await
        .unwrap();

    a.party.cancel(&caller_dialog).await.unwrap();

    caller_dialog.wait_for_state(terminated, WAIT).await.unwrap();
    callee_dialog.wait_for_state(terminated, WAIT).await.unwrap();
    assert_eq!(caller_dialog.last_error(), None, "487 after CANCEL is orderly");
}

/// One hundred parties, one socket; INVITEs are routed by request-URI AOR.
#[tokio::test]
async fn hundred_parties_share_one_socket_and_route_by_aor() {
    let first = Agent::spawn("user0").await.unwrap();
    let stack = first.stack.clone();
    let mut agents = vec![first];
    for i in 1..100 {
        agents.push(Agent::join(&format!("user{i}"), stack.clone()).await.unwrap());
    }

    assert_eq!(stack.transport().socket_count(), 1, "one shared socket");
    let addr = agents[0].addr;
    assert!(agents.iter().all(|a| a.addr == addr));

    // Dial one specific party from an outside agent.
    let caller = Agent::spawn("caller").await.unwrap();
    let target = format!("sip:user42@127.0.0.1:{}", addr.port());
    let dialog = caller.party.invite(&target).await.unwrap();

    let ringing = agents[42]
        .delegate
        .next_invite(WAIT)
        .await
        .expect("user42 got the INVITE");
    assert_eq!(ringing.local_uri().aor().as_str(), "user42@127.0.0.1");

    // Nobody else was disturbed.
    for (i, agent) in agents.iter().enumerate() {
        if i != 42 {
            assert!(
                agent
                    .delegate
                    .next_invite(Duration::from_millis(10))
                    .await
                    .is_none(),
                "user{i} must not see the INVITE"
            );
        }
    }

    agents[42].party.accept(&ringing).await.unwrap();
    dialog.wait_for_state(confirmed, WAIT).await.unwrap();
}

/// A datagram without Call-ID earns a 400 Bad Request and creates no state.
#[tokio::test]
async fn malformed_datagram_gets_a_400_and_no_state() {
    let metrics = CounterStackMetrics::new();
    let b = Agent::spawn_with(
        "bob",
        StackConfig {
            timers: Some(test_timers()),
            metrics: Some(metrics.clone()),
            ..StackConfig::default()
        },
    )
    .await
    .unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let raw = malformed_invite_datagram(&b.contact_uri());
    sender.send_to(&raw, b.addr).unwrap();

    let mut buf = [0u8; 2048];
    let (n, from) = sender.recv_from(&mut buf).expect("a reply arrived");
    assert_eq!(from, b.addr);
    let text = std::str::from_utf8(&buf[..n]).unwrap();
    assert!(text.starts_with("SIP/2.0 400 "), "got: {text}");

    // Exactly one parse failure counted, no dialog or pending call created.
    assert_eq!(metrics.parse_failures.load(Ordering::Relaxed), 1);
    assert!(b.delegate.next_invite(Duration::from_millis(50)).await.is_none());
    assert!(b.party.dialogs().is_empty());
}

/// OPTIONS out of dialog is answered 200 with an Allow list.
#[tokio::test]
async fn options_is_answered_with_allow() {
    let a = Agent::spawn("alice").await.unwrap();
    let b = Agent::spawn("bob").await.unwrap();
    // Fire and observe nothing explodes; the 200 terminates the client
    // transaction quietly.
    a.party.options(&b.contact_uri()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
}

/// Caller rejection: the callee declines with 486 and the caller's dialog
/// parks in Error with the status.
#[tokio::test]
async fn reject_surfaces_the_status_to_the_caller() {
    let a = Agent::spawn("alice").await.unwrap();
    let b = Agent::spawn("bob").await.unwrap();

    let caller_dialog = a.party.invite(&b.contact_uri()).await.unwrap();
    let callee_dialog = b.delegate.next_invite(WAIT).await.expect("inbound INVITE");

    b.party.reject(&callee_dialog, 486).await.unwrap();

    caller_dialog
        .wait_for_state(|s| *s == DialogState::Error, WAIT)
        .await
        .unwrap();
    assert_eq!(caller_dialog.last_error(), Some(DialogError::Rejected(486)));
    assert_eq!(callee_dialog.state(), DialogState::Terminated);
}

/// Re-INVITE: a confirmed dialog renegotiates; CSeq moves forward and the
/// dialog stays confirmed.
#[tokio::test]
async fn reinvite_keeps_the_dialog_confirmed() {
    let a = Agent::spawn("alice").await.unwrap();
    let b = Agent::spawn("bob").await.unwrap();

    let caller_dialog = a.party.invite(&b.contact_uri()).await.unwrap();
    let callee_dialog = b.delegate.next_invite(WAIT).await.unwrap();
    b.party.accept(&callee_dialog).await.unwrap();
    caller_dialog.wait_for_state(confirmed, WAIT).await.unwrap();

    a.party.reinvite(&caller_dialog).await.unwrap();
    // The re-INVITE is auto-answered; give the round trip a moment.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(caller_dialog.state(), DialogState::Confirmed);

    // Still a working dialog: BYE ends it.
    a.party.hangup(&caller_dialog).await.unwrap();
    caller_dialog.wait_for_state(terminated, WAIT).await.unwrap();
}

/// terminate() BYEs confirmed dialogs and releases the socket reference.
#[tokio::test]
async fn party_terminate_hangs_up_and_unregisters() {
    let a = Agent::spawn("alice").await.unwrap();
    let b = Agent::spawn("bob").await.unwrap();

    let caller_dialog = a.party.invite(&b.contact_uri()).await.unwrap();
    let callee_dialog = b.delegate.next_invite(WAIT).await.unwrap();
    b.party.accept(&callee_dialog).await.unwrap();
    caller_dialog.wait_for_state(confirmed, WAIT).await.unwrap();
    callee_dialog.wait_for_state(confirmed, WAIT).await.unwrap();

    a.party.terminate().await.unwrap();
    callee_dialog.wait_for_state(terminated, WAIT).await.unwrap();
}
