//! End-to-end protocol scenarios driven over an in-memory duplex stream,
//! using the bundled reference compiler/backend (`test-support`).

#![cfg(feature = "test-support")]

use std::sync::Arc;

use edgecore::backend::mock::MockBackend;
use edgecore::compiler::mock::MockCompiler;
use edgecore::Session;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

fn spawn_session() -> (DuplexStream, tokio::task::JoinHandle<Result<(), edgecore::EdgeError>>) {
    let (client, server) = duplex(64 * 1024);
    let session = Session::new(server, Arc::new(MockCompiler), MockBackend::new(), 1, 100);
    let handle = tokio::spawn(session.run());
    (client, handle)
}

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.push(tag);
    out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn cstr(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

fn len_str(s: &str) -> Vec<u8> {
    let mut v = (s.len() as u32).to_be_bytes().to_vec();
    v.extend_from_slice(s.as_bytes());
    v
}

async fn read_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 5];
    client.read_exact(&mut header).await.unwrap();
    let len = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len - 4];
    client.read_exact(&mut payload).await.unwrap();
    (header[0], payload)
}

async fn handshake(client: &mut DuplexStream) {
    client.write_all(&[0x00, 0x01, 0x00, 0x00]).await.unwrap();
    let mut auth_body = Vec::new();
    auth_body.extend_from_slice(&len_str("u"));
    auth_body.extend_from_slice(&len_str(""));
    auth_body.extend_from_slice(&len_str("d"));
    client.write_all(&frame(b'0', &auth_body)).await.unwrap();
    assert_eq!(read_frame(client).await.0, b'R');
    assert_eq!(read_frame(client).await.0, b'K');
    let (tag, payload) = read_frame(client).await;
    assert_eq!(tag, b'Z');
    assert_eq!(payload, vec![b'I']);
}

fn empty_bind_args() -> Vec<u8> {
    0i32.to_be_bytes().to_vec()
}

#[tokio::test]
async fn parse_describe_execute_sync_round_trip() {
    let (mut client, _handle) = spawn_session();
    handshake(&mut client).await;

    let mut parse_body = cstr(""); // empty statement name
    parse_body.extend_from_slice(&cstr("select 1"));
    client.write_all(&frame(b'P', &parse_body)).await.unwrap();
    let (tag, payload) = read_frame(&mut client).await;
    assert_eq!(tag, b'1');
    assert_eq!(payload.len(), 32); // input type id + output type id

    let mut describe_body = vec![b'T'];
    describe_body.extend_from_slice(&cstr(""));
    client.write_all(&frame(b'D', &describe_body)).await.unwrap();
    let (tag, _) = read_frame(&mut client).await;
    assert_eq!(tag, b'T');

    let mut execute_body = cstr("");
    execute_body.extend_from_slice(&empty_bind_args());
    client.write_all(&frame(b'E', &execute_body)).await.unwrap();
    client.write_all(&frame(b'S', &[])).await.unwrap();

    // the mock backend's parse_execute streams one row before reporting
    // completion, just as a real execute would stream its result set.
    let (tag, _) = read_frame(&mut client).await;
    assert_eq!(tag, b'D');
    let (tag, _) = read_frame(&mut client).await;
    assert_eq!(tag, b'C');
    let (tag, payload) = read_frame(&mut client).await;
    assert_eq!(tag, b'Z');
    assert_eq!(payload, vec![b'I']);
}

#[tokio::test]
async fn savepoint_rollback_restores_the_snapshot_and_clears_the_error_latch() {
    let (mut client, _handle) = spawn_session();
    handshake(&mut client).await;

    client
        .write_all(&frame(b'Q', &cstr("start transaction;")))
        .await
        .unwrap();
    assert_eq!(read_frame(&mut client).await.0, b'C');
    assert_eq!(read_frame(&mut client).await.1, vec![b'T']);

    client
        .write_all(&frame(b'Q', &cstr("declare savepoint s1;")))
        .await
        .unwrap();
    assert_eq!(read_frame(&mut client).await.0, b'C');
    assert_eq!(read_frame(&mut client).await.1, vec![b'T']);

    client
        .write_all(&frame(b'Q', &cstr("select 1/0;")))
        .await
        .unwrap();
    assert_eq!(read_frame(&mut client).await.0, b'E');
    assert_eq!(read_frame(&mut client).await.1, vec![b'E']);

    client
        .write_all(&frame(b'Q', &cstr("rollback to savepoint s1;")))
        .await
        .unwrap();
    assert_eq!(read_frame(&mut client).await.0, b'C');
    let (_, status) = read_frame(&mut client).await;
    assert_eq!(status, vec![b'T']);
}

#[tokio::test]
async fn opportunistic_execute_reparses_on_stale_type_ids() {
    let (mut client, _handle) = spawn_session();
    handshake(&mut client).await;

    let mut body = cstr("select 1");
    body.extend_from_slice(&[0xAA; 16]); // stale input type id
    body.extend_from_slice(&[0xBB; 16]); // stale output type id
    body.extend_from_slice(&empty_bind_args());
    client.write_all(&frame(b'O', &body)).await.unwrap();

    // no cache entry existed yet, so this always takes the re-parse branch:
    // a describe-type response, then the streamed row and command-complete
    // of the execute.
    let (tag, payload) = read_frame(&mut client).await;
    assert_eq!(tag, b'T');
    assert!(payload.len() >= 32);

    let (tag, _) = read_frame(&mut client).await;
    assert_eq!(tag, b'D');
    let (tag, _) = read_frame(&mut client).await;
    assert_eq!(tag, b'C');
}

#[tokio::test]
async fn legacy_script_concatenates_results_into_one_json_array() {
    let (mut client, _handle) = spawn_session();
    handshake(&mut client).await;

    let mut body = vec![b'e'];
    body.extend_from_slice(&cstr("select 1; select 2;"));
    client.write_all(&frame(b'L', &body)).await.unwrap();

    let (tag, payload) = read_frame(&mut client).await;
    assert_eq!(tag, b'L');
    assert_eq!(payload, b"[1,1]"); // the mock backend returns a literal "1" row per statement

    let (tag, status) = read_frame(&mut client).await;
    assert_eq!(tag, b'Z');
    assert_eq!(status, vec![b'I']);
}
