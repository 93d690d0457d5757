//! Bridges a non-blocking `mio::net::TcpStream` into `async fn` via
//! `std::future::poll_fn`, the same readiness-future shape `rt-http`'s pump
//! would use if curl's multi interface didn't already hide socket polling.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::task::{Poll, Waker};

use mio::net::TcpStream;
use mio::{Interest, Token};
use rt_core::LoopHandle;

use crate::error::MySqlError;

#[derive(Default)]
struct WakeSlot(RefCell<Option<Waker>>);

impl WakeSlot {
    fn park(&self, waker: &Waker) {
        *self.0.borrow_mut() = Some(waker.clone());
    }

    fn wake(&self) {
        if let Some(waker) = self.0.borrow_mut().take() {
            waker.wake();
        }
    }
}

pub struct Socket {
    stream: RefCell<TcpStream>,
    token: Token,
    handle: LoopHandle,
    read_slot: Rc<WakeSlot>,
    write_slot: Rc<WakeSlot>,
}

impl Socket {
    pub async fn connect(handle: &LoopHandle, addr: SocketAddr) -> Result<Self, MySqlError> {
        let mut stream = TcpStream::connect(addr).map_err(MySqlError::from)?;
        let token = handle.new_io_token();
        let read_slot = Rc::new(WakeSlot::default());
        let write_slot = Rc::new(WakeSlot::default());

        handle.with_io(|io| -> io::Result<()> {
            io.registry()
                .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
            let r = read_slot.clone();
            io.set_read_watcher(token, Box::new(move || r.wake()));
            let w = write_slot.clone();
            io.set_write_watcher(token, Box::new(move || w.wake()));
            Ok(())
        })
        .map_err(MySqlError::from)?;

        let socket = Socket {
            stream: RefCell::new(stream),
            token,
            handle: handle.clone(),
            read_slot,
            write_slot,
        };
        socket.wait_connected().await?;
        Ok(socket)
    }

    /// Waits for the first writable event, the usual readiness signal for a
    /// non-blocking `connect()` in progress, then checks `SO_ERROR` to tell a
    /// completed connection apart from a refused one.
    async fn wait_connected(&self) -> Result<(), MySqlError> {
        let woken = std::cell::Cell::new(false);
        std::future::poll_fn(|cx| {
            if woken.get() {
                return Poll::Ready(());
            }
            woken.set(true);
            self.write_slot.park(cx.waker());
            Poll::Pending
        })
        .await;
        let stream = self.stream.borrow();
        match stream.take_error()? {
            None => Ok(()),
            Some(e) => Err(MySqlError::from(e)),
        }
    }

    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize, MySqlError> {
        std::future::poll_fn(|cx| {
            let mut stream = self.stream.borrow_mut();
            match stream.read(buf) {
                Ok(n) => Poll::Ready(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_slot.park(cx.waker());
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(MySqlError::from(e))),
            }
        })
        .await
    }

    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), MySqlError> {
        while !data.is_empty() {
            let n = std::future::poll_fn(|cx| {
                let mut stream = self.stream.borrow_mut();
                match stream.write(data) {
                    Ok(n) => Poll::Ready(Ok(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.write_slot.park(cx.waker());
                        Poll::Pending
                    }
                    Err(e) => Poll::Ready(Err(MySqlError::from(e))),
                }
            })
            .await?;
            data = &data[n..];
        }
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let token = self.token;
        self.handle.with_io(|io| {
            io.remove_read_watcher(token);
            io.remove_write_watcher(token);
            let _ = io.registry().deregister(&mut *self.stream.borrow_mut());
        });
    }
}
