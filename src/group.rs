//! Named item groups: the optimized multi-item read/write surface. A group
//! owns its items, caches the read plan keyed by the negotiated PDU size and
//! rebuilds it atomically whenever the item set or the PDU size changes.

use crate::endpoint::S7Endpoint;
use crate::item::{Item, ItemValue};
use crate::protocol::error::{Error, Result};
use crate::protocol::frame::iter::VarSpec;
use crate::protocol::frame::owned::WriteDataItem;
use crate::protocol::planner::{plan_read, plan_write, ReadPlan};
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

type TranslateFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// A cached plan is only valid for the PDU size it was built against.
struct CachedPlan {
    plan: ReadPlan,
    /// Item names in span order; planner member indices point into this.
    order: Vec<String>,
    pdu_size: u16,
}

pub struct ItemGroup {
    endpoint: Arc<S7Endpoint>,
    items: HashMap<String, Item>,
    translate: Option<TranslateFn>,
    cached: Option<CachedPlan>,
    pdu_rx: watch::Receiver<u16>,
}

impl ItemGroup {
    pub fn new(endpoint: Arc<S7Endpoint>) -> Self {
        let pdu_rx = endpoint.pdu_size_watch();
        ItemGroup {
            endpoint,
            items: HashMap::new(),
            translate: None,
            cached: None,
            pdu_rx,
        }
    }

    /// Install a tag-name to address-string mapper applied before parsing.
    /// The default is identity.
    pub fn set_translation_callback<F>(&mut self, f: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.translate = Some(Arc::new(f));
    }

    fn translated(&self, tag: &str) -> String {
        match &self.translate {
            Some(f) => f(tag),
            None => tag.to_string(),
        }
    }

    /// Number of items in the group.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Add tags to the group. Each tag is translated, parsed and stored under
    /// its original name. Invalidates the cached plan.
    pub fn add_items<'a, I>(&mut self, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for tag in tags {
            let address = self.translated(tag);
            let item = Item::new(tag, &address)?;
            self.items.insert(tag.to_string(), item);
        }
        self.cached = None;
        Ok(())
    }

    /// Remove tags from the group. Unknown names are ignored. Invalidates the
    /// cached plan.
    pub fn remove_items<'a, I>(&mut self, tags: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for tag in tags {
            self.items.remove(tag);
        }
        self.cached = None;
    }

    /// Drop every item and the cached plan.
    pub fn clear(&mut self) {
        self.items.clear();
        self.cached = None;
    }

    /// Build or reuse the plan for the current PDU size.
    fn ensure_plan(&mut self, pdu_size: u16) -> Result<&CachedPlan> {
        // A pdu-size change observed on the watch invalidates silently.
        if let Some(cached) = &self.cached {
            if cached.pdu_size != pdu_size {
                self.cached = None;
            }
        }
        if self.cached.is_none() {
            let mut order: Vec<String> = self.items.keys().cloned().collect();
            order.sort();
            let spans: Vec<_> = order
                .iter()
                .map(|name| self.items[name].read_span())
                .collect();
            let cfg = self.endpoint.planner_config(pdu_size);
            let plan = plan_read(&cfg, &spans).map_err(|idx| {
                Error::InvalidArgument(format!(
                    "item '{}' cannot fit any read PDU",
                    order[idx]
                ))
            })?;
            self.cached = Some(CachedPlan {
                plan,
                order,
                pdu_size,
            });
        }
        Ok(self.cached.as_ref().unwrap())
    }

    /// Execute the optimized grouped read: issue every packet in parallel,
    /// scatter response windows into the items, decode, and return a fresh
    /// name-to-value mapping.
    pub async fn read_all_items(&mut self) -> Result<HashMap<String, ItemValue>> {
        if self.items.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.endpoint.connection()?;
        let pdu_size = *self.pdu_rx.borrow();
        if pdu_size == 0 {
            return Err(Error::IllegalState("PDU size not negotiated yet"));
        }
        self.ensure_plan(pdu_size)?;
        let cached = self.cached.as_ref().unwrap();

        let jobs = (0..cached.plan.packets.len())
            .map(|i| conn.request_read_vars(cached.plan.packet_specs(i)));
        let responses = try_join_all(jobs).await?;

        // Surface the first failing part before touching any item buffer.
        for (packet, results) in cached.plan.packets.iter().zip(&responses) {
            for (part, result) in packet.iter().zip(results) {
                if !result.code.is_ok() {
                    return Err(Error::ReturnCode {
                        code: result.code,
                        context: format!(
                            "area {:?} db {} bytes {}..{}",
                            part.area,
                            part.db,
                            part.start,
                            part.start + part.length as u32
                        ),
                    });
                }
                if result.data.len() < part.length {
                    return Err(Error::unexpected("short part in read response"));
                }
            }
        }

        for (packet, results) in cached.plan.packets.iter().zip(&responses) {
            for (part, result) in packet.iter().zip(results) {
                for member in &part.members {
                    let name = &cached.order[member.item];
                    let item = self
                        .items
                        .get_mut(name)
                        .ok_or(Error::IllegalState("plan references removed item"))?;
                    item.copy_from_window(&result.data, &member.copy)?;
                }
            }
        }

        let mut out = HashMap::with_capacity(self.items.len());
        for item in self.items.values_mut() {
            item.update_value_from_buffer()?;
            out.insert(item.name().to_string(), item.value().clone());
        }
        Ok(out)
    }

    /// Write values to tags. Tags not present in the group are materialized
    /// as throwaway items; a write never requires prior `add_items`. Writes
    /// are packed per PDU but a single item is never split.
    pub async fn write_items(&mut self, tags: &[&str], values: &[ItemValue]) -> Result<()> {
        if tags.len() != values.len() {
            return Err(Error::InvalidArgument(format!(
                "{} tags but {} values",
                tags.len(),
                values.len()
            )));
        }
        if tags.is_empty() {
            return Ok(());
        }
        let conn = self.endpoint.connection()?;
        let pdu_size = *self.pdu_rx.borrow();
        if pdu_size == 0 {
            return Err(Error::IllegalState("PDU size not negotiated yet"));
        }

        let mut specs: Vec<VarSpec> = Vec::with_capacity(tags.len());
        let mut payloads: Vec<WriteDataItem> = Vec::with_capacity(tags.len());
        let mut fills: Vec<usize> = Vec::with_capacity(tags.len());
        for (tag, value) in tags.iter().zip(values) {
            let scratch;
            let item = match self.items.get(*tag) {
                Some(item) => item,
                None => {
                    scratch = Item::new(*tag, &self.translated(tag))?;
                    &scratch
                }
            };
            let data = item.write_buffer(value)?;
            fills.push(data.len());
            specs.push(item.write_spec());
            payloads.push(WriteDataItem {
                transport: item.tag().write_transport,
                data,
            });
        }

        let cfg = self.endpoint.planner_config(pdu_size);
        let packets = plan_write(&cfg, &fills).map_err(|idx| Error::ItemTooBig {
            name: tags[idx].to_string(),
            bytes: fills[idx],
            // Budget per item: pdu - 12 packet headroom - 16 item overhead.
            max: (pdu_size as usize).saturating_sub(28),
        })?;

        let jobs = packets.iter().map(|indices| {
            let specs: Vec<VarSpec> = indices.iter().map(|&i| specs[i]).collect();
            let items: Vec<WriteDataItem> = indices.iter().map(|&i| payloads[i].clone()).collect();
            conn.request_write_vars(specs, items)
        });
        let results = try_join_all(jobs).await?;

        for (indices, codes) in packets.iter().zip(&results) {
            for (&idx, code) in indices.iter().zip(codes) {
                if !code.is_ok() {
                    return Err(Error::ReturnCode {
                        code: *code,
                        context: format!("writing '{}'", tags[idx]),
                    });
                }
            }
        }
        Ok(())
    }
}
