//! Assertion macros shared by integration tests.

/// Await a receive future and panic with the call site on failure.
#[macro_export]
macro_rules! recv_expect {
    ($fut:expr) => {{
        $fut.await
            .expect(concat!("recv failed at ", file!(), ":", line!()))
    }};
    ($fut:expr, $msg:expr) => {{
        let m = ::std::format!("{msg} at {}:{}", file!(), line!(), msg = $msg);
        $fut.await.expect(&m)
    }};
}

/// Assert that a message body matches a pattern, returning the bound value.
///
/// ```ignore
/// let open = expect_body!(peer.recv().await, MessageBody::OpenSession(open) => open);
/// ```
#[macro_export]
macro_rules! expect_body {
    ($message:expr, $pattern:pat => $value:expr) => {{
        let message = $message;
        match message.body {
            $pattern => $value,
            other => panic!(
                "unexpected body {other:?} (header {:?}) at {}:{}",
                message.header,
                file!(),
                line!()
            ),
        }
    }};
}

pub use crate::{expect_body, recv_expect};
