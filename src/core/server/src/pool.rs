// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The per-worker buffer loan pool: one spare read pipe and one spare write
//! pipe which can be transferred to a connection about to do work and
//! reclaimed when the connection goes idle between commands. The pool is
//! owned by its worker thread, so no synchronisation is involved.

use crate::connection::Connection;

use pipe::Pipe;

counter!(RBUF_EXISTING, "read pipes already present at loan time");
counter!(RBUF_LOANED, "read pipes loaned from the worker spare");
counter!(RBUF_ALLOCATED, "read pipes allocated fresh");
counter!(WBUF_EXISTING, "write pipes already present at loan time");
counter!(WBUF_LOANED, "write pipes loaned from the worker spare");
counter!(WBUF_ALLOCATED, "write pipes allocated fresh");

/// Result of a buffer loan attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferLoan {
    Existing,
    Loaned,
    Allocated,
}

/// The spare pipes held by a worker thread.
#[derive(Default)]
pub struct SparePipes {
    pub read: Option<Pipe>,
    pub write: Option<Pipe>,
}

/// Make sure `conn_buf` is populated, either by loaning the worker's spare or
/// by allocating a new pipe.
fn loan_single_pipe(
    spare: &mut Option<Pipe>,
    conn_buf: &mut Option<Pipe>,
    size: usize,
) -> BufferLoan {
    // already have a (possibly partial) buffer, nothing to do
    if conn_buf.is_some() {
        return BufferLoan::Existing;
    }

    if spare.is_some() {
        std::mem::swap(spare, conn_buf);
        return BufferLoan::Loaned;
    }

    *conn_buf = Some(Pipe::new(size));
    BufferLoan::Allocated
}

/// Return `conn_buf` to the worker if it is clean and the worker has no
/// spare; otherwise drop it.
fn maybe_return_single_pipe(spare: &mut Option<Pipe>, conn_buf: &mut Option<Pipe>) {
    let clean = conn_buf.as_ref().map(|p| p.empty()).unwrap_or(false);
    if !clean {
        return;
    }

    if spare.is_none() {
        std::mem::swap(spare, conn_buf);
    } else {
        *conn_buf = None;
    }
}

/// Ensure the connection has both pipes before its state machine runs.
pub fn loan_buffers(conn: &mut Connection, spares: &mut SparePipes, size: usize) {
    match loan_single_pipe(&mut spares.read, &mut conn.read, size) {
        BufferLoan::Existing => RBUF_EXISTING.increment(),
        BufferLoan::Loaned => RBUF_LOANED.increment(),
        BufferLoan::Allocated => RBUF_ALLOCATED.increment(),
    }

    match loan_single_pipe(&mut spares.write, &mut conn.write, size) {
        BufferLoan::Existing => WBUF_EXISTING.increment(),
        BufferLoan::Loaned => WBUF_LOANED.increment(),
        BufferLoan::Allocated => WBUF_ALLOCATED.increment(),
    }
}

/// Give clean pipes back to the worker once the connection yields. Change
/// feeds keep their buffers: their traffic is continuous.
pub fn return_buffers(conn: &mut Connection, spares: &mut SparePipes) {
    if conn.is_dcp() {
        return;
    }

    maybe_return_single_pipe(&mut spares.read, &mut conn.read);
    maybe_return_single_pipe(&mut spares.write, &mut conn.write);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loan_from_empty_pool_allocates() {
        let mut spare = None;
        let mut conn_buf = None;
        assert_eq!(
            loan_single_pipe(&mut spare, &mut conn_buf, 64),
            BufferLoan::Allocated
        );
        assert!(conn_buf.is_some());
        assert!(spare.is_none());
    }

    #[test]
    fn loan_transfers_ownership() {
        let mut spare = Some(Pipe::new(64));
        let mut conn_buf = None;
        assert_eq!(
            loan_single_pipe(&mut spare, &mut conn_buf, 64),
            BufferLoan::Loaned
        );
        // the pipe is in the connection or the pool, never both
        assert!(spare.is_none());
        assert!(conn_buf.is_some());
    }

    #[test]
    fn existing_buffer_untouched() {
        let mut spare = Some(Pipe::new(64));
        let mut conn_buf = Some(Pipe::new(64));
        assert_eq!(
            loan_single_pipe(&mut spare, &mut conn_buf, 64),
            BufferLoan::Existing
        );
        assert!(spare.is_some());
    }

    #[test]
    fn return_only_when_clean_and_pool_empty() {
        // dirty pipes stay with the connection
        let mut spare = None;
        let mut dirty = Pipe::new(64);
        dirty.wdata()[0] = 1;
        dirty.produced(1).unwrap();
        let mut conn_buf = Some(dirty);
        maybe_return_single_pipe(&mut spare, &mut conn_buf);
        assert!(spare.is_none());
        assert!(conn_buf.is_some());

        // clean pipes go to an empty pool
        let mut conn_buf = Some(Pipe::new(64));
        maybe_return_single_pipe(&mut spare, &mut conn_buf);
        assert!(spare.is_some());
        assert!(conn_buf.is_none());

        // a second clean pipe is dropped, the pool holds at most one
        let mut conn_buf = Some(Pipe::new(64));
        maybe_return_single_pipe(&mut spare, &mut conn_buf);
        assert!(spare.is_some());
        assert!(conn_buf.is_none());
    }
}
