//! rtnetlink plumbing.
//!
//! The engine itself is synchronous; every netlink operation opens a
//! short-lived connection on a current-thread tokio runtime and blocks on
//! it. That keeps the netlink socket on whichever OS thread issued the call,
//! which matters inside a netns traversal (see [`super::netns`]).

use std::future::Future;

use futures::TryStreamExt;
use netlink_packet_route::link::LinkMessage;
use rtnetlink::Handle;

use crate::errors::{Error, Result};

/// Run one netlink conversation to completion on this thread.
pub fn with_handle<T, Fut, F>(f: F) -> Result<T>
where
    F: FnOnce(Handle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .map_err(|e| Error::Network(format!("failed to build netlink runtime: {e}")))?;

    rt.block_on(async move {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| Error::Network(format!("failed to open netlink socket: {e}")))?;
        tokio::spawn(connection);
        f(handle).await
    })
}

/// Interface index by name, `None` when the link does not exist.
pub async fn link_index(handle: &Handle, name: &str) -> Result<Option<u32>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(LinkMessage { header, .. })) => Ok(Some(header.index)),
        Ok(None) => Ok(None),
        Err(e) if is_code(&e, libc::ENODEV) => Ok(None),
        Err(e) => Err(netlink_err("link get", name, e)),
    }
}

pub async fn set_link_up(handle: &Handle, index: u32) -> Result<()> {
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| netlink_err("link set up", &index.to_string(), e))
}

pub(crate) fn netlink_err(op: &str, subject: &str, e: rtnetlink::Error) -> Error {
    Error::Network(format!("{op} {subject}: {e}"))
}

fn is_code(err: &rtnetlink::Error, code: i32) -> bool {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|c| -c.get()) == Some(code),
        _ => false,
    }
}

/// EEXIST is fine when ensuring state (address already set, route already
/// present).
pub fn tolerate_exists(result: std::result::Result<(), rtnetlink::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if is_code(&e, libc::EEXIST) => Ok(()),
        Err(e) => Err(Error::Network(e.to_string())),
    }
}

/// ENODEV/ENOENT/ESRCH are fine when tearing state down.
pub fn tolerate_missing(result: std::result::Result<(), rtnetlink::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e)
            if is_code(&e, libc::ENODEV)
                || is_code(&e, libc::ENOENT)
                || is_code(&e, libc::ESRCH) =>
        {
            Ok(())
        }
        Err(e) => Err(Error::Network(e.to_string())),
    }
}
