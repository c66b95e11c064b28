//! Read/write packing planner. Pure CPU work: takes typed spans, produces
//! packets of parts that honor the negotiated PDU capacity, coalescing
//! adjacent reads and splitting oversized ones. The session and item-group
//! layers execute the plan; nothing here touches I/O.

use super::frame::iter::VarSpec;
use super::frame::types::{MemoryArea, Transport};
use std::cmp::max;
use std::mem::take;

/// Fixed request overhead per packet: 10-byte Job header + function + count.
const REQ_PACKET_OVERHEAD: usize = 12;
/// Fixed response overhead per packet: 12-byte AckData header + function + count.
const RESP_PACKET_OVERHEAD: usize = 14;
/// Request bytes per part: one S7-ANY variable specification.
const REQ_PART_OVERHEAD: usize = 12;
/// Response bytes per part before data: return code, transport, length.
const RESP_PART_OVERHEAD: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct PlannerConfig {
    /// Negotiated PDU size.
    pub pdu_size: u16,
    /// Maximum gap in bytes bridged when coalescing adjacent reads.
    pub optimization_gap: usize,
    /// Disable coalescing entirely.
    pub skip_optimization: bool,
}

impl PlannerConfig {
    pub fn new(pdu_size: u16) -> Self {
        Self {
            pdu_size,
            optimization_gap: 5,
            skip_optimization: false,
        }
    }

    /// Maximum payload usable by parameter/data bytes in one PDU.
    #[inline]
    pub fn max_payload(&self) -> usize {
        (self.pdu_size as usize).saturating_sub(18)
    }
}

/// One item's read window, already promoted to byte addressing for
/// bit-addressed tags.
#[derive(Debug, Clone, Copy)]
pub struct ReadSpan {
    pub area: MemoryArea,
    /// DB number, 0 outside DB/IDB areas.
    pub db: u16,
    /// Wire transport of the span. Counter/Timer keep their own transport;
    /// everything else is read as a byte window.
    pub transport: Transport,
    pub start: u32,
    /// Window length in bytes.
    pub length: usize,
    /// Bit offset of the underlying tag, sort tie-break only.
    pub bit: u8,
    /// Oversized spans may split across packets; bit-addressed spans never do.
    pub splittable: bool,
}

/// Where a response part's bytes land in one item's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopySpec {
    /// Offset within the part's response window.
    pub source_offset: usize,
    /// Offset within the item's buffer.
    pub dest_offset: usize,
    pub byte_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartMember {
    /// Index into the span slice handed to the planner.
    pub item: usize,
    pub copy: CopySpec,
}

/// One request part: a contiguous read window shared by its members.
#[derive(Debug, Clone)]
pub struct ReadPart {
    pub area: MemoryArea,
    pub db: u16,
    pub transport: Transport,
    pub start: u32,
    pub length: usize,
    pub members: Vec<PartMember>,
}

impl ReadPart {
    #[inline]
    fn end(&self) -> u32 {
        self.start + self.length as u32
    }

    /// The S7-ANY spec requesting this part.
    pub fn to_spec(&self) -> VarSpec {
        let count = match self.transport {
            Transport::Counter | Transport::Timer => (self.length / 2) as u16,
            _ => self.length as u16,
        };
        VarSpec {
            transport: self.transport,
            count,
            db: self.db,
            area: self.area,
            byte_offset: self.start,
            bit_offset: 0,
        }
    }
}

/// Planner output: an ordered list of packets, each an ordered list of parts.
#[derive(Debug, Clone, Default)]
pub struct ReadPlan {
    pub packets: Vec<Vec<ReadPart>>,
}

impl ReadPlan {
    pub fn packet_specs(&self, packet: usize) -> Vec<VarSpec> {
        self.packets[packet].iter().map(ReadPart::to_spec).collect()
    }
}

/// Plan a grouped read. Spans that cannot fit a fresh packet and may not
/// split are rejected with the offending span index.
pub fn plan_read(cfg: &PlannerConfig, spans: &[ReadSpan]) -> Result<ReadPlan, usize> {
    let max_payload = cfg.max_payload();

    // Sort order drives packing determinism: area code, db, byte offset, bit
    // offset ascending, then byte length descending so larger covering spans
    // come first and smaller ones coalesce into them.
    let mut order: Vec<usize> = (0..spans.len()).collect();
    order.sort_by(|&a, &b| {
        let (sa, sb) = (&spans[a], &spans[b]);
        (sa.area as u8)
            .cmp(&(sb.area as u8))
            .then_with(|| sa.db.cmp(&sb.db))
            .then_with(|| sa.start.cmp(&sb.start))
            .then_with(|| sa.bit.cmp(&sb.bit))
            .then_with(|| sb.length.cmp(&sa.length))
            .then_with(|| a.cmp(&b))
    });

    let mut packets: Vec<Vec<ReadPart>> = Vec::new();
    let mut cur: Vec<ReadPart> = Vec::new();
    let mut req_len = REQ_PACKET_OVERHEAD;
    let mut resp_len = RESP_PACKET_OVERHEAD;

    for &idx in &order {
        let span = &spans[idx];
        let elem = match span.transport {
            Transport::Counter | Transport::Timer => 2,
            _ => 1,
        };
        let mut seg_start = span.start;
        let mut dest = 0usize;
        let mut remaining = span.length;

        while remaining > 0 {
            // Coalesce into the open part when the span is close enough.
            if !cfg.skip_optimization && dest == 0 {
                if let Some(part) = cur.last_mut() {
                    if coalescable(part, span, seg_start, cfg.optimization_gap) {
                        let new_end = max(part.end(), seg_start + remaining as u32);
                        let delta = (new_end - part.end()) as usize;
                        if resp_len + delta <= max_payload {
                            part.length = (new_end - part.start) as usize;
                            part.members.push(PartMember {
                                item: idx,
                                copy: CopySpec {
                                    source_offset: (seg_start - part.start) as usize,
                                    dest_offset: 0,
                                    byte_count: remaining,
                                },
                            });
                            resp_len += delta;
                            remaining = 0;
                            continue;
                        }
                    }
                }
            }

            // Open a new part in the current packet when everything fits.
            if req_len + REQ_PART_OVERHEAD <= max_payload
                && resp_len + RESP_PART_OVERHEAD + remaining <= max_payload
            {
                cur.push(new_part(span, seg_start, remaining, idx, dest));
                req_len += REQ_PART_OVERHEAD;
                resp_len += RESP_PART_OVERHEAD + remaining;
                remaining = 0;
                continue;
            }

            // Split: consume whatever response room is left, then continue
            // with the remainder in the next packet.
            if span.splittable && req_len + REQ_PART_OVERHEAD <= max_payload {
                let budget = max_payload.saturating_sub(resp_len + RESP_PART_OVERHEAD);
                let take_bytes = (budget / elem * elem).min(remaining);
                if take_bytes > 0 {
                    cur.push(new_part(span, seg_start, take_bytes, idx, dest));
                    // Counter/Timer addresses advance in elements, not bytes.
                    seg_start += (take_bytes / elem) as u32;
                    dest += take_bytes;
                    remaining -= take_bytes;
                    packets.push(take(&mut cur));
                    req_len = REQ_PACKET_OVERHEAD;
                    resp_len = RESP_PACKET_OVERHEAD;
                    continue;
                }
            }

            // Nothing fit here: close the packet and retry on a fresh one.
            if cur.is_empty() {
                // A fresh packet cannot hold this span and it may not split.
                return Err(idx);
            }
            packets.push(take(&mut cur));
            req_len = REQ_PACKET_OVERHEAD;
            resp_len = RESP_PACKET_OVERHEAD;
        }
    }

    if !cur.is_empty() {
        packets.push(cur);
    }
    Ok(ReadPlan { packets })
}

fn new_part(span: &ReadSpan, start: u32, length: usize, idx: usize, dest: usize) -> ReadPart {
    ReadPart {
        area: span.area,
        db: span.db,
        transport: part_transport(span.transport),
        start,
        length,
        members: vec![PartMember {
            item: idx,
            copy: CopySpec {
                source_offset: 0,
                dest_offset: dest,
                byte_count: length,
            },
        }],
    }
}

/// Parts covering byte-addressed tags are requested as byte windows; any
/// bit-addressed member was already promoted, so only Counter/Timer keep
/// their element transport.
#[inline]
fn part_transport(t: Transport) -> Transport {
    match t {
        Transport::Counter | Transport::Timer => t,
        _ => Transport::Byte,
    }
}

fn coalescable(part: &ReadPart, span: &ReadSpan, seg_start: u32, gap: usize) -> bool {
    if part.area != span.area || part.db != span.db {
        return false;
    }
    if !span.area.is_optimizable() {
        return false;
    }
    if part.transport != Transport::Byte || part_transport(span.transport) != Transport::Byte {
        return false;
    }
    let distance = (seg_start as i64 - part.end() as i64).unsigned_abs() as usize;
    distance < gap
}

/// Plan write packets: per item `16 + byte_length_with_fill` bytes against a
/// `pdu_size - 12` budget, no splitting. Returns packet item-index groups, or
/// the index of an item whose encoded size alone exceeds the budget.
pub fn plan_write(cfg: &PlannerConfig, fills: &[usize]) -> Result<Vec<Vec<usize>>, usize> {
    const PER_ITEM_OVERHEAD: usize = 16;
    let budget = (cfg.pdu_size as usize).saturating_sub(12);

    let mut packets: Vec<Vec<usize>> = Vec::new();
    let mut cur: Vec<usize> = Vec::new();
    let mut cur_len = 0usize;

    for (idx, &fill) in fills.iter().enumerate() {
        let add = PER_ITEM_OVERHEAD + fill;
        if add > budget {
            return Err(idx);
        }
        if cur_len + add > budget {
            packets.push(take(&mut cur));
            cur_len = 0;
        }
        cur.push(idx);
        cur_len += add;
    }
    if !cur.is_empty() {
        packets.push(cur);
    }
    Ok(packets)
}

/// Structural equality of two plans, used to verify rebuild determinism.
pub fn plans_equal(a: &ReadPlan, b: &ReadPlan) -> bool {
    if a.packets.len() != b.packets.len() {
        return false;
    }
    a.packets.iter().zip(&b.packets).all(|(pa, pb)| {
        pa.len() == pb.len()
            && pa.iter().zip(pb).all(|(x, y)| {
                x.area == y.area
                    && x.db == y.db
                    && x.transport == y.transport
                    && x.start == y.start
                    && x.length == y.length
                    && x.members == y.members
            })
    })
}

impl ReadPlan {
    /// Verify the capacity invariants for every packet. Test support.
    #[cfg(test)]
    fn assert_capacity(&self, cfg: &PlannerConfig) {
        let max_payload = cfg.max_payload();
        for packet in &self.packets {
            let resp: usize = RESP_PACKET_OVERHEAD
                + packet
                    .iter()
                    .map(|p| p.length + RESP_PART_OVERHEAD)
                    .sum::<usize>();
            let req = REQ_PACKET_OVERHEAD + packet.len() * REQ_PART_OVERHEAD;
            assert!(resp <= max_payload, "response overflow: {resp}");
            assert!(req <= max_payload, "request overflow: {req}");
        }
    }
}
