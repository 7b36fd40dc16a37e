//! readiness poller
//!
//! thin wrapper over the OS readiness mechanism. every registered source
//! carries its socket-arena index as the token, so an event maps straight
//! back to the owning socket without any lookup table.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

/// one readiness report for a registered source
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
        })
    }

    pub fn add(
        &self,
        source: &mut (impl Source + ?Sized),
        token: usize,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, Token(token), interest)
    }

    pub fn modify(
        &self,
        source: &mut (impl Source + ?Sized),
        token: usize,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(source, Token(token), interest)
    }

    pub fn remove(&self, source: &mut (impl Source + ?Sized)) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// run one poll iteration, appending readiness reports to `out`
    pub fn poll(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        for event in self.events.iter() {
            out.push(Readiness {
                token: event.token().0,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            });
        }
        Ok(())
    }
}
