//! Payload preparation for the inspection dispatcher.
//!
//! TCP payloads are put back into stream order with a per-direction
//! reorder buffer before they reach `inspect_stream`; IPv4 fragments are
//! collected into whole datagrams before `inspect_datagram`. Both live with
//! the connection's packet worker, so all state is single-flow and
//! lock-free.

use etherparse::{TcpHeaderSlice, UdpHeaderSlice};
use packet_info::{PacketInfo, TransportProtocol};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Upper bound on buffered out-of-order bytes per stream direction.
const MAX_STREAM_BUFFER: usize = 256 * 1024;
/// How long a partial datagram waits for its missing fragments.
const FRAGMENT_TTL: Duration = Duration::from_secs(30);
/// Partial datagrams kept per connection.
const MAX_PARTIAL_DATAGRAMS: usize = 16;

/// Payload data ready for an inspector.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InspectData {
    /// In-order TCP stream bytes.
    Stream(Vec<u8>),
    /// One complete datagram payload.
    Datagram(Vec<u8>),
}

/// Per-connection payload pipeline: defragmentation, then reassembly.
#[derive(Default)]
pub(crate) struct PayloadPipeline {
    stream: StreamReassembler,
    fragments: Defragmenter,
}

impl PayloadPipeline {
    /// Feeds one packet's payload; returns data once it is inspectable.
    ///
    /// Fragments yield nothing until the datagram is whole; out-of-order
    /// TCP segments yield nothing until the gap closes.
    pub(crate) fn feed(
        &mut self,
        info: &PacketInfo,
        payload: &[u8],
        now: Instant,
    ) -> Option<InspectData> {
        if let Some(fragment) = &info.fragment {
            let datagram = self.fragments.push(
                fragment.ident,
                fragment.offset,
                fragment.more_fragments,
                payload,
                now,
            )?;

            // A reassembled datagram still carries its transport header.
            return self.dispatch_segment(info, &datagram);
        }

        match info.protocol {
            TransportProtocol::Tcp => {
                let meta = info.tcp.as_ref()?;
                let data = self.stream.push(info.inbound, meta.seq, meta.syn, payload);

                (!data.is_empty()).then_some(InspectData::Stream(data))
            }
            TransportProtocol::Udp => {
                (!payload.is_empty()).then(|| InspectData::Datagram(payload.to_vec()))
            }
            _ => None,
        }
    }

    fn dispatch_segment(&mut self, info: &PacketInfo, segment: &[u8]) -> Option<InspectData> {
        match info.protocol {
            TransportProtocol::Tcp => {
                let header = TcpHeaderSlice::from_slice(segment).ok()?;
                let payload = &segment[header.slice().len()..];
                let data =
                    self.stream
                        .push(info.inbound, header.sequence_number(), header.syn(), payload);

                (!data.is_empty()).then_some(InspectData::Stream(data))
            }
            TransportProtocol::Udp => {
                let header = UdpHeaderSlice::from_slice(segment).ok()?;
                let payload = segment[header.slice().len()..].to_vec();

                (!payload.is_empty()).then_some(InspectData::Datagram(payload))
            }
            _ => None,
        }
    }
}

/// Serial-number comparison per RFC 1982: is `a` strictly before `b`?
fn seq_before(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// Puts TCP payload bytes back into stream order, per direction.
#[derive(Default)]
struct StreamReassembler {
    transmit: DirectionBuffer,
    receive: DirectionBuffer,
}

impl StreamReassembler {
    /// Returns the bytes that became contiguous through this segment.
    fn push(&mut self, inbound: bool, seq: u32, syn: bool, payload: &[u8]) -> Vec<u8> {
        let buffer = if inbound { &mut self.receive } else { &mut self.transmit };

        buffer.push(seq, syn, payload)
    }
}

#[derive(Default)]
struct DirectionBuffer {
    /// The next expected sequence number; set by SYN or first segment.
    next_seq: Option<u32>,
    /// Out-of-order segments, trimmed to start at or after `next_seq`.
    pending: Vec<(u32, Vec<u8>)>,
    buffered: usize,
}

impl DirectionBuffer {
    fn push(&mut self, seq: u32, syn: bool, payload: &[u8]) -> Vec<u8> {
        if syn {
            // A (re)handshake resets the stream.
            self.next_seq = Some(seq.wrapping_add(1));
            self.pending.clear();
            self.buffered = 0;
            return Vec::new();
        }

        if payload.is_empty() {
            return Vec::new();
        }

        let next = *self.next_seq.get_or_insert(seq);

        if seq_before(seq, next) {
            // Retransmission of (partially) delivered data.
            let delivered = next.wrapping_sub(seq) as usize;
            if delivered >= payload.len() {
                return Vec::new();
            }

            self.store(next, payload[delivered..].to_vec());
        } else {
            self.store(seq, payload.to_vec());
        }

        self.drain()
    }

    fn store(&mut self, seq: u32, data: Vec<u8>) {
        if self
            .pending
            .iter()
            .any(|(s, existing)| *s == seq && existing.len() >= data.len())
        {
            // Plain retransmission of a segment we already hold.
            return;
        }

        if self.buffered + data.len() > MAX_STREAM_BUFFER {
            tracing::debug!(%seq, buffered = %self.buffered, "Stream reorder buffer full, dropping segment");
            return;
        }

        self.pending.retain(|(s, existing)| {
            let keep = *s != seq || existing.len() > data.len();
            if !keep {
                self.buffered -= existing.len();
            }
            keep
        });

        self.buffered += data.len();
        self.pending.push((seq, data));
    }

    fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::new();

        loop {
            let next = self.next_seq.unwrap_or_default();

            let Some(idx) = self.pending.iter().position(|(s, _)| *s == next) else {
                break;
            };

            let (_, data) = self.pending.swap_remove(idx);
            self.buffered -= data.len();

            let new_next = next.wrapping_add(data.len() as u32);
            out.extend(data);
            self.next_seq = Some(new_next);

            // Trim segments the emitted range overlaps.
            let mut trimmed = Vec::with_capacity(self.pending.len());
            for (s, mut data) in self.pending.drain(..) {
                if !seq_before(s, new_next) {
                    trimmed.push((s, data));
                    continue;
                }

                let overlap = new_next.wrapping_sub(s) as usize;
                if overlap >= data.len() {
                    self.buffered -= data.len();
                    continue;
                }

                self.buffered -= overlap;
                data.drain(..overlap);
                trimmed.push((new_next, data));
            }
            self.pending = trimmed;
        }

        out
    }
}

/// Collects IPv4 fragments into whole datagrams.
#[derive(Default)]
struct Defragmenter {
    partial: HashMap<u16, PartialDatagram>,
}

struct PartialDatagram {
    /// Chunks keyed by byte offset.
    chunks: Vec<(u16, Vec<u8>)>,
    /// Total datagram length; known once the last fragment arrived.
    total: Option<usize>,
    first_seen: Instant,
}

impl Defragmenter {
    /// Adds one fragment; returns the whole IP payload when complete.
    fn push(
        &mut self,
        ident: u16,
        offset: u16,
        more_fragments: bool,
        chunk: &[u8],
        now: Instant,
    ) -> Option<Vec<u8>> {
        self.partial
            .retain(|_, partial| now.duration_since(partial.first_seen) < FRAGMENT_TTL);

        if self.partial.len() >= MAX_PARTIAL_DATAGRAMS && !self.partial.contains_key(&ident) {
            let oldest = self
                .partial
                .iter()
                .min_by_key(|(_, partial)| partial.first_seen)
                .map(|(ident, _)| *ident);

            if let Some(oldest) = oldest {
                tracing::debug!(ident = %oldest, "Too many partial datagrams, dropping oldest");
                self.partial.remove(&oldest);
            }
        }

        let partial = self.partial.entry(ident).or_insert_with(|| PartialDatagram {
            chunks: Vec::new(),
            total: None,
            first_seen: now,
        });

        if !more_fragments {
            partial.total = Some(offset as usize + chunk.len());
        }

        partial.chunks.retain(|(existing, _)| *existing != offset);
        partial.chunks.push((offset, chunk.to_vec()));

        let total = partial.total?;
        let datagram = partial.assemble(total)?;

        self.partial.remove(&ident);

        Some(datagram)
    }
}

impl PartialDatagram {
    /// Stitches the chunks together; `None` while gaps remain.
    fn assemble(&mut self, total: usize) -> Option<Vec<u8>> {
        self.chunks.sort_by_key(|(offset, _)| *offset);

        let mut datagram = Vec::with_capacity(total);

        for (offset, chunk) in &self.chunks {
            let offset = *offset as usize;

            if offset > datagram.len() {
                return None;
            }

            // Chunks may overlap on retransmission; keep the first copy.
            let fresh = datagram.len() - offset;
            if fresh < chunk.len() {
                datagram.extend_from_slice(&chunk[fresh..]);
            }
        }

        (datagram.len() >= total).then(|| {
            datagram.truncate(total);
            datagram
        })
    }
}
