mod common;

use std::collections::HashMap;
use std::sync::Arc;

use async_std::prelude::*;
use futures_lite::future::zip;
use futures_lite::stream;
use http_types::StatusCode;
use pretty_assertions::assert_eq;

use common::{parse_head, read_to_end, read_until, TestIO};
use h1_engine::server::{
    accept, accept_with_opts, body_of, empty_body, Outbound, OutboundStream, ServerOptions,
};
use h1_engine::Exception;

const GET_KEEP_ALIVE: &[u8] =
    b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n";

#[async_std::test]
async fn empty_handler_replies_with_an_empty_ok_and_keeps_the_connection() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |_req, _res| async { Ok(empty_body()) });
    let client_fut = async {
        client.write_all(GET_KEEP_ALIVE).await.unwrap();
        let response = read_until(&mut client, "\r\n\r\n").await;
        assert_eq!(response, "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");

        // the connection stayed open for a second exchange
        client.write_all(GET_KEEP_ALIVE).await.unwrap();
        let response = read_until(&mut client, "\r\n\r\n").await;
        assert_eq!(response, "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");

        client.close();
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn handler_errors_before_headers_reply_500_and_close() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |_req, _res| async {
        Err::<OutboundStream, Exception>("handler blew up".into())
    });
    let client_fut = async {
        client.write_all(GET_KEEP_ALIVE).await.unwrap();
        let response = read_to_end(&mut client).await;
        assert_eq!(
            response,
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        );
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn handler_errors_mid_stream_terminate_the_body_and_close() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |_req, _res| async {
        let elements = vec![
            Ok(Outbound::data("partial")),
            Err::<Outbound, Exception>("stream broke".into()),
        ];
        Ok(Box::pin(stream::iter(elements)) as OutboundStream)
    });
    let client_fut = async {
        client.write_all(GET_KEEP_ALIVE).await.unwrap();
        let response = read_to_end(&mut client).await;
        assert_eq!(
            response,
            "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n7\r\npartial\r\n0\r\n\r\n"
        );
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn no_content_statuses_never_carry_a_body() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |_req, res| async move {
        res.set_status(StatusCode::NoContent)?;
        res.set_header("content-length", "5")?;
        Ok(body_of(Outbound::data("hello")))
    });
    let client_fut = async {
        client.write_all(GET_KEEP_ALIVE).await.unwrap();
        let response = read_until(&mut client, "\r\n\r\n").await;
        assert_eq!(
            response,
            "HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n"
        );
        client.close();
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn request_bodies_are_echoed_with_chunked_framing() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |mut req, _res| async move {
        let body = req.receive().into_bytes().await;
        Ok(body_of(Outbound::data(body)))
    });
    let client_fut = async {
        client
            .write_all(b"POST / HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        let response = read_until(&mut client, "0\r\n\r\n").await;
        assert_eq!(
            response,
            "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
        );
        client.close();
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn chunked_request_bodies_are_reassembled() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |mut req, _res| async move {
        let body = req.receive().into_bytes().await;
        assert_eq!(body, b"hello world");
        Ok(body_of(Outbound::data(body)))
    });
    let client_fut = async {
        client
            .write_all(
                b"POST / HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\n\
                  6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        let response = read_until(&mut client, "0\r\n\r\n").await;
        assert!(response.ends_with("B\r\nhello world\r\n0\r\n\r\n"));
        client.close();
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn explicit_content_length_disables_chunked_framing() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |_req, res| async move {
        res.set_header("content-length", "5")?;
        res.chunked_transfer(false);
        Ok(body_of(Outbound::data("hello")))
    });
    let client_fut = async {
        client.write_all(GET_KEEP_ALIVE).await.unwrap();
        // switching away from chunked framing also drops persistence
        let response = read_to_end(&mut client).await;
        assert_eq!(response, "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello");
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn http_1_0_requests_default_to_close() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |_req, _res| async { Ok(empty_body()) });
    let client_fut = async {
        client
            .write_all(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let response = read_to_end(&mut client).await;
        assert_eq!(response, "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn unread_request_bodies_are_discarded_between_exchanges() {
    let (mut client, server) = TestIO::new();

    let server_view = server.clone();
    let server_fut = async {
        accept(server, |_req, _res| async { Ok(empty_body()) })
            .await
            .unwrap();
        server_view.close();
    };
    let client_fut = async {
        // both requests are pipelined before the first response arrives
        client
            .write_all(
                b"POST / HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello\
                  GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
            )
            .await
            .unwrap();
        client.close();
        let responses = read_to_end(&mut client).await;
        assert_eq!(
            responses,
            "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n\
             HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n"
        );
    };

    let ((), ()) = zip(server_fut, client_fut).await;
}

#[async_std::test]
async fn route_params_resolve_lazily_through_the_configured_resolver() {
    let (mut client, server) = TestIO::new();

    let opts = ServerOptions {
        params_resolver: Some(Arc::new(|path: &str| {
            let mut params = HashMap::new();
            params.insert("path".to_owned(), path.to_owned());
            Some(params)
        })),
        ..Default::default()
    };
    let server_fut = accept_with_opts(server, |req, _res| async move {
        let path = req.param("path").expect("resolver supplies the path");
        assert_eq!(req.params().unwrap()["path"], path);
        Ok(body_of(Outbound::data(path)))
    }, opts);
    let client_fut = async {
        client
            .write_all(b"GET /widgets/42 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let response = read_until(&mut client, "0\r\n\r\n").await;
        assert!(response.contains("/widgets/42"));
        client.close();
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn request_cookies_are_decoded_from_the_cookie_header() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |mut req, _res| async move {
        let session = req.cookies()["session"][0].value().to_owned();
        Ok(body_of(Outbound::data(session)))
    });
    let client_fut = async {
        client
            .write_all(
                b"GET / HTTP/1.1\r\nHost: example.com\r\nCookie: session=opaque; theme=dark\r\n\r\n",
            )
            .await
            .unwrap();
        let response = read_until(&mut client, "0\r\n\r\n").await;
        assert!(response.contains("6\r\nopaque\r\n"));
        client.close();
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn send_redirect_replies_found_with_a_location() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |_req, res| async move { Ok(res.send_redirect("/new")?) });
    let client_fut = async {
        client.write_all(GET_KEEP_ALIVE).await.unwrap();
        let response = read_until(&mut client, "\r\n\r\n").await;
        let (status_line, headers) = parse_head(&response);
        assert_eq!(status_line, "HTTP/1.1 302 Found");
        assert!(headers.contains("location: /new"));
        assert!(headers.contains("content-length: 0"));
        client.close();
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}

#[async_std::test]
async fn file_bodies_are_delivered_in_chunks() {
    let (mut client, server) = TestIO::new();

    let path = std::env::temp_dir().join(format!("h1-engine-file-test-{}", std::process::id()));
    std::fs::write(&path, b"file payload").unwrap();

    let file = path.clone();
    let server_fut = accept(server, move |_req, _res| {
        let file = file.clone();
        async move { Ok(body_of(Outbound::file(file))) }
    });
    let client_fut = async {
        client.write_all(GET_KEEP_ALIVE).await.unwrap();
        let response = read_until(&mut client, "0\r\n\r\n").await;
        assert_eq!(
            response,
            "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\nC\r\nfile payload\r\n0\r\n\r\n"
        );
        client.close();
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
    std::fs::remove_file(&path).ok();
}

#[async_std::test]
async fn missing_files_reply_not_found() {
    let (mut client, server) = TestIO::new();

    let server_fut = accept(server, |_req, _res| async {
        Ok(body_of(Outbound::file("/definitely/not/here")))
    });
    let client_fut = async {
        client.write_all(GET_KEEP_ALIVE).await.unwrap();
        let response = read_until(&mut client, "\r\n\r\n").await;
        assert_eq!(
            response,
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n"
        );
        client.close();
    };

    let (result, ()) = zip(server_fut, client_fut).await;
    result.unwrap();
}
