//! incremental frame decoding
//!
//! the decoder is fed whatever the transport produced and yields complete
//! message, ping, pong and close events. parser state survives arbitrary
//! split points, including mid-header and mid-payload, and unmasking happens
//! in place as payload bytes stream through. a message that arrives whole in
//! a single read is handed to the sink without copying, anything else is
//! reassembled in the fragment buffer. control frames interleaved between
//! fragments accumulate in their own buffer so the in-progress message is
//! undisturbed.

use std::ops::ControlFlow;

use bytes::BytesMut;

use crate::errors::ProtocolError;
use crate::frame::{parse_close_payload, parse_opcode, OpCode, MAX_CONTROL_PAYLOAD};
use crate::mask::apply_mask;
use crate::utf8::Utf8Validator;

/// largest accepted message payload, frames advertising more than this
/// terminate the connection immediately
pub(crate) const MAX_MESSAGE: u64 = 16 * 1024 * 1024;

/// a complete protocol event produced by the decoder
#[derive(Debug)]
pub(crate) enum Event<'a> {
    /// a full data message, fragments already reassembled and text already
    /// validated
    Message { opcode: OpCode, data: &'a [u8] },
    Ping(&'a [u8]),
    Pong(&'a [u8]),
    /// a validated close frame, code 1005 when the payload was empty
    Close { code: u16, reason: &'a [u8] },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Header,
    Len16,
    Len64,
    Mask,
    Payload,
}

/// resumable frame parser for one connection
#[derive(Debug)]
pub(crate) struct FrameDecoder {
    stage: Stage,
    hbuf: [u8; 8],
    have: usize,
    fin: bool,
    opcode: OpCode,
    masked: bool,
    mask: [u8; 4],
    payload_len: u64,
    payload_read: u64,
    /// servers require masked inbound frames, clients unmasked
    expect_masked: bool,
    fragment_opcode: Option<OpCode>,
    fragment_buf: BytesMut,
    control_buf: BytesMut,
    utf8: Utf8Validator,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(false)
    }
}

impl FrameDecoder {
    pub fn new(expect_masked: bool) -> Self {
        Self {
            stage: Stage::Header,
            hbuf: [0; 8],
            have: 0,
            fin: false,
            opcode: OpCode::Continue,
            masked: false,
            mask: [0; 4],
            payload_len: 0,
            payload_read: 0,
            expect_masked,
            fragment_opcode: None,
            fragment_buf: BytesMut::new(),
            control_buf: BytesMut::new(),
            utf8: Utf8Validator::default(),
        }
    }

    /// consume `input`, emitting events into `sink`
    ///
    /// masked payloads are unmasked in place. a `Break` from the sink stops
    /// parsing, used when a handler closed the socket mid-batch.
    pub fn consume<F>(&mut self, input: &mut [u8], sink: &mut F) -> Result<(), ProtocolError>
    where
        F: for<'a> FnMut(Event<'a>) -> ControlFlow<()>,
    {
        let mut i = 0;
        loop {
            match self.stage {
                Stage::Header => {
                    if !self.fill(&input[..], &mut i, 2) {
                        break;
                    }
                    self.parse_head()?;
                }
                Stage::Len16 => {
                    if !self.fill(&input[..], &mut i, 2) {
                        break;
                    }
                    self.payload_len = u64::from(u16::from_be_bytes([self.hbuf[0], self.hbuf[1]]));
                    self.length_known()?;
                }
                Stage::Len64 => {
                    if !self.fill(&input[..], &mut i, 8) {
                        break;
                    }
                    if self.hbuf[0] & 0x80 != 0 {
                        return Err(ProtocolError::PayloadTooLarge(u64::MAX));
                    }
                    self.payload_len = u64::from_be_bytes(self.hbuf);
                    self.length_known()?;
                }
                Stage::Mask => {
                    if !self.fill(&input[..], &mut i, 4) {
                        break;
                    }
                    self.mask.copy_from_slice(&self.hbuf[..4]);
                    self.stage = Stage::Payload;
                }
                Stage::Payload => {
                    if self.payload_len == 0 {
                        let flow = self.route_chunk(&[], 0, true, sink)?;
                        self.stage = Stage::Header;
                        self.have = 0;
                        if flow.is_break() {
                            return Ok(());
                        }
                        continue;
                    }
                    if i == input.len() {
                        break;
                    }
                    let start = self.payload_read;
                    let take = ((self.payload_len - start) as usize).min(input.len() - i);
                    let chunk = &mut input[i..i + take];
                    if self.masked {
                        apply_mask(chunk, self.mask, (start % 4) as usize);
                    }
                    self.payload_read += take as u64;
                    i += take;
                    let remaining = self.payload_len - self.payload_read;
                    let whole = start == 0 && remaining == 0;
                    let flow = self.route_chunk(&input[i - take..i], remaining, whole, sink)?;
                    if remaining == 0 {
                        self.stage = Stage::Header;
                        self.have = 0;
                    }
                    if flow.is_break() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn fill(&mut self, input: &[u8], i: &mut usize, need: usize) -> bool {
        let take = (need - self.have).min(input.len() - *i);
        self.hbuf[self.have..self.have + take].copy_from_slice(&input[*i..*i + take]);
        self.have += take;
        *i += take;
        self.have == need
    }

    fn parse_head(&mut self) -> Result<(), ProtocolError> {
        let (b0, b1) = (self.hbuf[0], self.hbuf[1]);
        // compression is never negotiated, any reserved bit fails the
        // connection
        if b0 & 0x70 != 0 {
            return Err(ProtocolError::InvalidLeadingBits(b0 >> 4));
        }
        let opcode = parse_opcode(b0)?;
        let fin = b0 & 0x80 != 0;
        let masked = b1 & 0x80 != 0;
        if masked != self.expect_masked {
            return Err(ProtocolError::InvalidMaskBit);
        }
        let len7 = b1 & 0x7F;
        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControlFrame);
            }
            if len7 as usize > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooBig(len7 as usize));
            }
        } else {
            match opcode {
                OpCode::Continue if self.fragment_opcode.is_none() => {
                    return Err(ProtocolError::MissInitialFragmentedFrame)
                }
                OpCode::Text | OpCode::Binary if self.fragment_opcode.is_some() => {
                    return Err(ProtocolError::NotContinueFrameAfterFragmented)
                }
                _ => {}
            }
            if !fin && opcode != OpCode::Continue {
                self.fragment_opcode = Some(opcode);
            }
        }
        self.fin = fin;
        self.opcode = opcode;
        self.masked = masked;
        self.have = 0;
        match len7 {
            126 => self.stage = Stage::Len16,
            127 => self.stage = Stage::Len64,
            n => {
                self.payload_len = u64::from(n);
                self.length_known()?;
            }
        }
        Ok(())
    }

    fn length_known(&mut self) -> Result<(), ProtocolError> {
        if self.opcode.is_data() {
            let total = self.fragment_buf.len() as u64 + self.payload_len;
            if total > MAX_MESSAGE {
                return Err(ProtocolError::PayloadTooLarge(total));
            }
        }
        self.have = 0;
        self.payload_read = 0;
        self.stage = if self.masked { Stage::Mask } else { Stage::Payload };
        Ok(())
    }

    /// feed one unmasked payload chunk to the right accumulator and emit
    /// completed events
    ///
    /// `whole` means the chunk covers the entire frame payload, which
    /// together with fin and an empty fragment buffer allows zero-copy
    /// delivery
    fn route_chunk<F>(
        &mut self,
        chunk: &[u8],
        remaining: u64,
        whole: bool,
        sink: &mut F,
    ) -> Result<ControlFlow<()>, ProtocolError>
    where
        F: for<'a> FnMut(Event<'a>) -> ControlFlow<()>,
    {
        if self.opcode.is_data() {
            let opcode = self.fragment_opcode.unwrap_or(self.opcode);
            let is_text = opcode == OpCode::Text;
            if is_text && !self.utf8.feed(chunk) {
                return Err(ProtocolError::InvalidUtf8);
            }
            if whole && self.fin && self.fragment_buf.is_empty() {
                if is_text && !self.utf8.finish() {
                    return Err(ProtocolError::InvalidUtf8);
                }
                self.fragment_opcode = None;
                return Ok(sink(Event::Message { opcode, data: chunk }));
            }
            self.fragment_buf.extend_from_slice(chunk);
            if remaining == 0 && self.fin {
                if is_text && !self.utf8.finish() {
                    return Err(ProtocolError::InvalidUtf8);
                }
                let flow = sink(Event::Message {
                    opcode,
                    data: &self.fragment_buf,
                });
                self.fragment_buf.clear();
                self.fragment_opcode = None;
                return Ok(flow);
            }
            Ok(ControlFlow::Continue(()))
        } else {
            self.control_buf.extend_from_slice(chunk);
            if remaining > 0 {
                return Ok(ControlFlow::Continue(()));
            }
            let flow = match self.opcode {
                OpCode::Close => {
                    let (code, reason) = parse_close_payload(&self.control_buf)?;
                    sink(Event::Close { code, reason })
                }
                OpCode::Ping => sink(Event::Ping(&self.control_buf)),
                _ => sink(Event::Pong(&self.control_buf)),
            };
            self.control_buf.clear();
            Ok(flow)
        }
    }
}
