//! Blocking request/response links between a task and its child task threads.
//!
//! Frames are encoded [`Request`]s and [`Response`]s sent over a pair of `mpsc` channels. A
//! parent sends one request and blocks until the answer arrives; nothing else is shared.

use crate::error::Error;
use crate::protocol::{Layout, Request, Response};
use bytes::Bytes;
use log::error;
use std::panic;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Parent side of a link.
pub struct Link {
    id: u32,
    layout: Layout,
    to_child: Sender<Bytes>,
    from_child: Receiver<Bytes>,
    handle: Option<JoinHandle<()>>,
}

/// Child side of a link, handed to the task thread.
pub struct Endpoint {
    id: u32,
    layout: Layout,
    to_parent: Sender<Bytes>,
    from_parent: Receiver<Bytes>,
}

impl Link {
    /// Starts thread `hseg-task-<id>` running `body`.
    pub fn spawn<F>(id: u32, layout: Layout, body: F) -> Result<Link, Error>
    where
        F: FnOnce(Endpoint) + Send + 'static,
    {
        let (to_child, from_parent) = channel();
        let (to_parent, from_child) = channel();
        let endpoint = Endpoint {
            id,
            layout,
            to_parent,
            from_parent,
        };
        let handle = thread::Builder::new()
            .name(format!("hseg-task-{id}"))
            .spawn(move || body(endpoint))
            .map_err(|e| Error::Spawn {
                id,
                reason: e.to_string(),
            })?;
        Ok(Link {
            id,
            layout,
            to_child,
            from_child,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Sends `request` and blocks until the child answers. A child that reports failure turns
    /// into [`Error::TaskFailed`].
    pub fn request(&mut self, request: &Request) -> Result<Response, Error> {
        if self.to_child.send(request.encode()).is_err() {
            return Err(self.disconnected());
        }
        let frame = match self.from_child.recv() {
            Ok(frame) => frame,
            Err(_) => return Err(self.disconnected()),
        };
        match Response::decode(frame, &self.layout)? {
            Response::Failed(message) => Err(Error::TaskFailed {
                id: self.id,
                message,
            }),
            response => Ok(response),
        }
    }

    /// Joins a child that hung up. A child that panicked takes the caller down with it.
    fn disconnected(&mut self) -> Error {
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                error!("task {} panicked, aborting", self.id);
                panic::resume_unwind(payload);
            }
        }
        Error::Disconnected(self.id)
    }

    /// Asks the child to shut down its subtree and exit, and joins its thread.
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.request(&Request::Shutdown)?.into_ack()?;
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                panic::resume_unwind(payload);
            }
        }
        Ok(())
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if self.to_child.send(Request::Shutdown.encode()).is_ok() {
                let _ = self.from_child.recv();
            }
            let _ = handle.join();
        }
    }
}

impl Endpoint {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Blocks for the next request. `None` once the parent hung up.
    pub fn recv(&self) -> Option<Result<Request, Error>> {
        self.from_parent.recv().ok().map(Request::decode)
    }

    pub fn send(&self, response: &Response) -> Result<(), Error> {
        self.to_parent
            .send(response.encode(&self.layout))
            .map_err(|_| Error::Disconnected(self.id))
    }
}
