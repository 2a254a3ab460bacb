#![allow(missing_docs)]

mod support;

use std::time::Duration;

use nimbus::remote::{LogClient, LogService, PageClient, PageService};
use nimbus::types::{Lsn, NimbusError, PageId, ServiceKind, TimelineId, WalRecord, PAGE_SIZE};
use support::{page_fill, FakeLogService, FakePageService, ReplyQuirk};

const TIMEOUT: Duration = Duration::from_secs(2);

fn timeline(raw: u64) -> TimelineId {
    TimelineId::new(raw).unwrap()
}

#[test]
fn page_client_reads_full_pages_over_one_connection() {
    let service = FakePageService::start();
    service.state().timelines.insert(7, 0);
    let mut client = PageClient::connect(&service.url(), TIMEOUT).unwrap();
    for page_number in [0u32, 3, 300] {
        let page = client.read_page(PageId::new(timeline(7), page_number)).unwrap();
        assert_eq!(page.len(), PAGE_SIZE);
        assert!(page.iter().all(|b| *b == page_fill(page_number)));
    }
    let state = service.state();
    assert_eq!(state.page_reads, 3);
    assert_eq!(state.connections, 1);
}

#[test]
fn page_client_rejects_short_pages() {
    let service = FakePageService::start();
    {
        let mut state = service.state();
        state.timelines.insert(1, 0);
        state.short_pages = true;
    }
    let mut client = PageClient::connect(&service.url(), TIMEOUT).unwrap();
    let err = client.read_page(PageId::new(timeline(1), 0)).unwrap_err();
    assert!(matches!(err, NimbusError::Protocol(_)), "unexpected error: {err:?}");
}

fn quirky_page_service(quirk: ReplyQuirk) -> FakePageService {
    let service = FakePageService::start();
    let mut state = service.state();
    state.timelines.insert(6, 0);
    state.quirk = Some(quirk);
    drop(state);
    service
}

#[test]
fn page_client_rejects_absurd_content_length() {
    let service = quirky_page_service(ReplyQuirk::HugeLength);
    let mut client = PageClient::connect(&service.url(), TIMEOUT).unwrap();
    let err = client.read_page(PageId::new(timeline(6), 1)).unwrap_err();
    assert!(matches!(err, NimbusError::Protocol(_)), "unexpected error: {err:?}");
}

#[test]
fn page_client_rejects_body_cut_short_of_its_length() {
    let service = quirky_page_service(ReplyQuirk::Truncated);
    let mut client = PageClient::connect(&service.url(), TIMEOUT).unwrap();
    let err = client.read_page(PageId::new(timeline(6), 1)).unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {err:?}");
    assert!(!client.is_connected());
}

#[test]
fn page_client_caps_unframed_bodies() {
    let service = quirky_page_service(ReplyQuirk::Unframed);
    let mut client = PageClient::connect(&service.url(), TIMEOUT).unwrap();
    let err = client.read_page(PageId::new(timeline(6), 1)).unwrap_err();
    assert!(matches!(err, NimbusError::Protocol(_)), "unexpected error: {err:?}");
}

#[test]
fn page_client_reads_chunked_pages() {
    let service = quirky_page_service(ReplyQuirk::Chunked);
    let mut client = PageClient::connect(&service.url(), TIMEOUT).unwrap();
    for page_number in [1u32, 2] {
        let page = client.read_page(PageId::new(timeline(6), page_number)).unwrap();
        assert_eq!(page.len(), PAGE_SIZE);
        assert!(page.iter().all(|b| *b == page_fill(page_number)));
    }
    assert_eq!(service.state().connections, 1);
}

#[test]
fn page_client_surfaces_remote_status() {
    let service = FakePageService::start();
    let mut client = PageClient::connect(&service.url(), TIMEOUT).unwrap();
    let err = client.read_page(PageId::new(timeline(99), 0)).unwrap_err();
    assert!(matches!(
        err,
        NimbusError::Remote {
            kind: ServiceKind::Page,
            status: 404,
            ..
        }
    ));
    assert!(!err.is_retryable());
}

#[test]
fn page_client_timeline_lifecycle() {
    let service = FakePageService::start();
    let mut client = PageClient::connect(&service.url(), TIMEOUT).unwrap();
    client.create_timeline(timeline(5)).unwrap();
    service.state().timelines.insert(5, 42);
    assert_eq!(client.timeline_info(timeline(5)).unwrap(), Lsn(42));
    client.delete_timeline(timeline(5)).unwrap();
    assert!(client.timeline_info(timeline(5)).is_err());
    assert!(client.get_server_status().is_ok());
}

#[test]
fn page_client_reconnects_once_after_dropped_connection() {
    let service = FakePageService::start();
    service.state().timelines.insert(2, 0);
    let mut client = PageClient::connect(&service.url(), TIMEOUT).unwrap();
    service.state().drop_next = true;
    let page = client.read_page(PageId::new(timeline(2), 1)).unwrap();
    assert_eq!(page[0], page_fill(1));
    assert_eq!(service.state().connections, 2);
}

#[test]
fn page_client_honours_connection_close() {
    let service = FakePageService::start();
    service.state().close_each = true;
    let mut client = PageClient::connect(&service.url(), TIMEOUT).unwrap();
    client.check_availability().unwrap();
    assert!(!client.is_connected());
    client.check_availability().unwrap();
    assert_eq!(service.state().connections, 2);
}

#[test]
fn page_client_refuses_unreachable_service() {
    let err = match PageClient::connect("http://127.0.0.1:1", Duration::from_millis(200)) {
        Ok(_) => panic!("connected to a closed port"),
        Err(err) => err,
    };
    assert!(err.is_retryable(), "unexpected error: {err:?}");
}

#[test]
fn log_client_appends_and_reports_committed_lsn() {
    let service = FakeLogService::start();
    let mut client = LogClient::connect_to(service.addr(), TIMEOUT).unwrap();
    assert!(client.is_connected());
    client.create_timeline(timeline(3)).unwrap();
    for lsn in 1..=3u64 {
        let record = WalRecord::new(Lsn(lsn), format!("row-{lsn}").into_bytes()).unwrap();
        assert_eq!(client.append(timeline(3), &record).unwrap(), Lsn(lsn));
    }
    assert_eq!(client.get_timeline_status(timeline(3)).unwrap(), Lsn(3));
    assert_eq!(service.lsns(), vec![1, 2, 3]);
    assert_eq!(service.state().appended[1].data, b"row-2");
    assert_eq!(service.state().connections, 1);
}

#[test]
fn log_client_keeps_connection_on_remote_error() {
    let service = FakeLogService::start();
    service.state().reject_appends = true;
    let mut client = LogClient::connect_to(service.addr(), TIMEOUT).unwrap();
    let record = WalRecord::new(Lsn(1), b"x".to_vec()).unwrap();
    let err = client.append(timeline(1), &record).unwrap_err();
    assert!(matches!(
        err,
        NimbusError::Remote {
            kind: ServiceKind::Log,
            status: 503,
            ..
        }
    ));
    assert!(client.is_connected());
    client.check_availability().unwrap();
    assert_eq!(service.state().connections, 1);
}

#[test]
fn log_client_fails_append_on_dropped_stream_and_reconnects_next_call() {
    let service = FakeLogService::start();
    let mut client = LogClient::connect_to(service.addr(), TIMEOUT).unwrap();
    service.state().drop_next = true;
    let record = WalRecord::new(Lsn(9), b"again".to_vec()).unwrap();
    let err = client.append(timeline(4), &record).unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {err:?}");
    assert!(!client.is_connected());
    assert!(service.lsns().is_empty());
    assert_eq!(client.append(timeline(4), &record).unwrap(), Lsn(9));
    assert_eq!(service.lsns(), vec![9]);
    assert_eq!(service.state().connections, 2);
}

#[test]
fn log_client_never_resends_append_after_lost_ack() {
    let service = FakeLogService::start();
    let mut client = LogClient::connect_to(service.addr(), TIMEOUT).unwrap();
    service.state().drop_reply = true;
    let first = WalRecord::new(Lsn(1), b"stored".to_vec()).unwrap();
    assert!(client.append(timeline(4), &first).is_err());
    assert_eq!(service.lsns(), vec![1]);
    let second = WalRecord::new(Lsn(2), b"next".to_vec()).unwrap();
    assert_eq!(client.append(timeline(4), &second).unwrap(), Lsn(2));
    assert_eq!(service.lsns(), vec![1, 2]);
}

#[test]
fn log_client_retries_idempotent_requests_once() {
    let service = FakeLogService::start();
    let mut client = LogClient::connect_to(service.addr(), TIMEOUT).unwrap();
    service.state().drop_next = true;
    client.check_availability().unwrap();
    assert!(client.is_connected());
    let state = service.state();
    assert_eq!(state.pings, 1);
    assert_eq!(state.connections, 2);
}

#[test]
fn log_client_disconnect_and_readdress() {
    let first = FakeLogService::start();
    let second = FakeLogService::start();
    let mut client = LogClient::connect_to(first.addr(), TIMEOUT).unwrap();
    client.disconnect();
    assert!(!client.is_connected());
    client.set_server_address(second.addr());
    client.check_availability().unwrap();
    assert!(client.is_connected());
    assert_eq!(second.state().pings, 1);
    assert_eq!(first.state().pings, 0);
}
