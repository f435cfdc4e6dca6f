//! Exchange timeout spanning all block waits of one call

mod common;

use std::time::Duration;

use common::{Peer, ScriptedLink, Step, fast_config};
use se05x_t1::{BlockKind, LinkStatus, ReadyError, Seq, Session, SupervisoryKind, T1Config, TransportError};

const DELAY: Duration = Duration::from_millis(100);

fn slow_session(config: T1Config, script: impl IntoIterator<Item = Step>) -> Session<ScriptedLink> {
    let peer = Peer::new(&config);
    let mut link = ScriptedLink::new([peer.s_response(SupervisoryKind::Resync, &[])]);
    link.extend(script);
    let mut session = Session::connect(link, config).unwrap();
    session.link_mut().read_delay = DELAY;
    session
}

fn deadline_config() -> T1Config {
    fast_config()
        .with_block_timeout(Duration::from_millis(100))
        .with_exchange_timeout(Duration::from_millis(150))
        .with_block_retransmits(10)
}

#[test]
fn test_exchange_timeout_escalates() {
    let config = deadline_config();
    let peer = Peer::new(&config);
    let mut session = slow_session(
        config,
        [
            Step::Timeout,
            Step::Timeout,
            peer.s_response(SupervisoryKind::Resync, &[]),
        ],
    );

    let error = session.transceive(&[0x00, 0xCA]).unwrap_err();
    assert!(matches!(error, TransportError::Timeout));
    assert_eq!(session.status(), LinkStatus::Idle);
    assert_eq!(session.statistics().resyncs, 1);

    // The retry budget is far from spent when the deadline passes
    assert_eq!(
        peer.kinds(&session.link().writes[1..]),
        [
            BlockKind::Information {
                seq: Seq::ZERO,
                more: false
            },
            BlockKind::ReceiveReady {
                seq: Seq::ZERO,
                error: ReadyError::Other
            },
            BlockKind::ReceiveReady {
                seq: Seq::ZERO,
                error: ReadyError::Other
            },
            BlockKind::request(SupervisoryKind::Resync),
        ]
    );

    // The second wait is cut short by the deadline
    let timeouts = &session.link().read_timeouts;
    assert_eq!(timeouts[1], Duration::from_millis(100));
    assert!(timeouts[2] < Duration::from_millis(100));
}

#[test]
fn test_exchange_timeout_without_resync_closes() {
    let config = deadline_config();
    let mut session = slow_session(config, [Step::Timeout, Step::Timeout]);

    let error = session.transceive(&[0x00, 0xCA]).unwrap_err();
    assert!(matches!(error, TransportError::RecoveryExhausted));
    assert_eq!(session.status(), LinkStatus::Closed);
    assert_eq!(session.link().closed, 1);
}

#[test]
fn test_wtx_pushes_deadline_out() {
    let config = deadline_config();
    let peer = Peer::new(&config);
    let mut session = slow_session(
        config,
        [
            peer.s_request(SupervisoryKind::Wtx, &[1]),
            peer.s_request(SupervisoryKind::Wtx, &[1]),
            peer.i_block(Seq::ZERO, false, &[0x90, 0x00]),
        ],
    );

    // Three slow blocks take twice the exchange timeout
    let response = session.transceive(&[0x80, 0x20]).unwrap();
    assert_eq!(response, &[0x90, 0x00]);
    assert_eq!(session.wtx_extension(), Duration::from_millis(200));
    assert_eq!(session.statistics().resyncs, 0);
}
