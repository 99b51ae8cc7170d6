//! Declarative memory layout of a serialized graph.
//!
//! A layout splits the data buffer into a static region, whose allocations
//! have fixed byte offsets and sizes and whose contents come from the weight
//! blob, and a dynamic region, whose extents may be placeholders until the
//! graph is bound to concrete shapes. Dynamic offsets are relative to the end
//! of the static region. All extents are in bytes and every tensor is `f32`.

mod placeholder;

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use placeholder::{Placeholder, PlaceholderContext};

/// Width of one buffer element in bytes
pub const ELEMENT_SIZE: usize = std::mem::size_of::<f32>();

/// Either a concrete byte count or a deferred expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Extent {
    Value(usize),
    Placeholder(Placeholder),
}

impl Extent {
    /// Concrete value, if there is one
    pub fn value(&self) -> Option<usize> {
        match self {
            Extent::Value(value) => Some(*value),
            Extent::Placeholder(_) => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Extent::Value(_))
    }

    /// Evaluate against `ctx`; negative results are rejected
    pub fn resolve(&self, ctx: &PlaceholderContext) -> Result<usize> {
        match self {
            Extent::Value(value) => Ok(*value),
            Extent::Placeholder(placeholder) => {
                let value = placeholder.eval(ctx)?;
                usize::try_from(value).map_err(|_| Error::InvalidExpression {
                    expression: placeholder.to_string(),
                    message: format!("evaluated to negative extent {}", value),
                })
            }
        }
    }
}

impl Default for Extent {
    fn default() -> Self {
        Extent::Value(0)
    }
}

impl From<usize> for Extent {
    fn from(value: usize) -> Self {
        Extent::Value(value)
    }
}

impl From<Placeholder> for Extent {
    fn from(placeholder: Placeholder) -> Self {
        Extent::Placeholder(placeholder)
    }
}

/// Allocation in the static region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAllocation {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// Allocation in the dynamic region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicAllocation {
    pub name: String,
    pub offset: Extent,
    pub size: Extent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRegion {
    pub size: usize,
    #[serde(default)]
    pub allocations: BTreeMap<String, StaticAllocation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicRegion {
    #[serde(default)]
    pub size: Extent,
    #[serde(default)]
    pub allocations: BTreeMap<String, DynamicAllocation>,
}

/// Which region an allocation lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Static,
    Dynamic,
}

/// Allocation with a concrete absolute byte offset into the data buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAllocation {
    pub name: String,
    pub region: Region,
    pub offset: usize,
    pub size: usize,
}

impl ResolvedAllocation {
    /// Element range in an `f32` data buffer
    pub fn elements(&self) -> Range<usize> {
        let start = self.offset / ELEMENT_SIZE;
        start..start + self.size / ELEMENT_SIZE
    }

    pub fn len(&self) -> usize {
        self.size / ELEMENT_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLayout {
    #[serde(rename = "static")]
    pub static_region: StaticRegion,
    #[serde(rename = "dynamic", default)]
    pub dynamic_region: DynamicRegion,
}

impl MemoryLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a static allocation right after the current end of the region
    pub fn push_static(&mut self, name: impl Into<String>, size: usize) -> &mut Self {
        let name = name.into();
        let offset = self.static_region.size;
        self.static_region.size += size;
        self.static_region.allocations.insert(
            name.clone(),
            StaticAllocation { name, offset, size },
        );
        self
    }

    /// Insert a dynamic allocation with explicit extents
    pub fn push_dynamic(
        &mut self,
        name: impl Into<String>,
        offset: impl Into<Extent>,
        size: impl Into<Extent>,
    ) -> &mut Self {
        let name = name.into();
        self.dynamic_region.allocations.insert(
            name.clone(),
            DynamicAllocation {
                name,
                offset: offset.into(),
                size: size.into(),
            },
        );
        self
    }

    /// Set the total size of the dynamic region
    pub fn set_dynamic_size(&mut self, size: impl Into<Extent>) -> &mut Self {
        self.dynamic_region.size = size.into();
        self
    }

    /// Whether every dynamic extent is concrete
    pub fn is_resolved(&self) -> bool {
        self.unresolved().is_empty()
    }

    /// Descriptions of the extents that are still placeholders
    pub fn unresolved(&self) -> Vec<String> {
        let mut pending = Vec::new();
        if let Extent::Placeholder(p) = &self.dynamic_region.size {
            pending.push(format!("dynamic.size = {}", p));
        }
        for allocation in self.dynamic_region.allocations.values() {
            if let Extent::Placeholder(p) = &allocation.offset {
                pending.push(format!("{}.offset = {}", allocation.name, p));
            }
            if let Extent::Placeholder(p) = &allocation.size {
                pending.push(format!("{}.size = {}", allocation.name, p));
            }
        }
        pending
    }

    /// Fail unless every extent is concrete
    pub fn ensure_resolved(&self) -> Result<()> {
        let pending = self.unresolved();
        if pending.is_empty() {
            Ok(())
        } else {
            Err(Error::UnresolvedPlaceholder(pending.join(", ")))
        }
    }

    /// Copy of this layout with every placeholder evaluated against `ctx`
    pub fn bind(&self, ctx: &PlaceholderContext) -> Result<MemoryLayout> {
        let mut allocations = BTreeMap::new();
        for (key, allocation) in &self.dynamic_region.allocations {
            allocations.insert(
                key.clone(),
                DynamicAllocation {
                    name: allocation.name.clone(),
                    offset: Extent::Value(allocation.offset.resolve(ctx)?),
                    size: Extent::Value(allocation.size.resolve(ctx)?),
                },
            );
        }

        let bound = MemoryLayout {
            static_region: self.static_region.clone(),
            dynamic_region: DynamicRegion {
                size: Extent::Value(self.dynamic_region.size.resolve(ctx)?),
                allocations,
            },
        };
        bound.validate()?;
        Ok(bound)
    }

    /// Check the structural invariants.
    ///
    /// Names are unique across both regions, map keys match allocation
    /// names, extents are element aligned and concrete allocations stay
    /// inside their region. Static allocations must not overlap; dynamic
    /// ones may share storage.
    pub fn validate(&self) -> Result<()> {
        check_aligned("static.size", self.static_region.size)?;
        for (key, allocation) in &self.static_region.allocations {
            check_key(key, &allocation.name)?;
            check_aligned(&format!("{}.offset", key), allocation.offset)?;
            check_aligned(&format!("{}.size", key), allocation.size)?;
            let end = checked_end(key, allocation.offset, allocation.size)?;
            if end > self.static_region.size {
                return Err(Error::layout(format!(
                    "static allocation '{}' ({}..{}) exceeds the static region ({} bytes)",
                    key, allocation.offset, end, self.static_region.size
                )));
            }
        }
        check_static_overlap(&self.static_region)?;

        let dynamic_size = self.dynamic_region.size.value();
        if let Some(size) = dynamic_size {
            check_aligned("dynamic.size", size)?;
        }
        for (key, allocation) in &self.dynamic_region.allocations {
            check_key(key, &allocation.name)?;
            if self.static_region.allocations.contains_key(key) {
                return Err(Error::layout(format!(
                    "allocation '{}' appears in both regions",
                    key
                )));
            }
            if let Some(offset) = allocation.offset.value() {
                check_aligned(&format!("{}.offset", key), offset)?;
            }
            if let Some(size) = allocation.size.value() {
                check_aligned(&format!("{}.size", key), size)?;
            }
            if let (Some(offset), Some(size), Some(region)) =
                (allocation.offset.value(), allocation.size.value(), dynamic_size)
            {
                let end = checked_end(key, offset, size)?;
                if end > region {
                    return Err(Error::layout(format!(
                        "dynamic allocation '{}' ({}..{}) exceeds the dynamic region ({} bytes)",
                        key, offset, end, region
                    )));
                }
            }
        }

        Ok(())
    }

    /// Total size of both regions in bytes; requires a resolved layout
    pub fn total_size(&self) -> Result<usize> {
        self.ensure_resolved()?;
        let dynamic = self.dynamic_region.size.value().unwrap_or(0);
        self.static_region
            .size
            .checked_add(dynamic)
            .ok_or_else(|| Error::layout("total buffer size overflows usize"))
    }

    /// Look up an allocation by name, with its absolute offset
    pub fn allocation(&self, name: &str) -> Result<ResolvedAllocation> {
        if let Some(allocation) = self.static_region.allocations.get(name) {
            return Ok(ResolvedAllocation {
                name: allocation.name.clone(),
                region: Region::Static,
                offset: allocation.offset,
                size: allocation.size,
            });
        }

        let allocation = self
            .dynamic_region
            .allocations
            .get(name)
            .ok_or_else(|| Error::not_found(format!("allocation '{}'", name)))?;
        match (&allocation.offset, &allocation.size) {
            (Extent::Value(offset), Extent::Value(size)) => {
                let absolute = checked_end(name, self.static_region.size, *offset)?;
                checked_end(name, absolute, *size)?;
                Ok(ResolvedAllocation {
                    name: allocation.name.clone(),
                    region: Region::Dynamic,
                    offset: absolute,
                    size: *size,
                })
            }
            _ => Err(Error::UnresolvedPlaceholder(format!(
                "allocation '{}' has symbolic extents",
                name
            ))),
        }
    }
}

fn check_key(key: &str, name: &str) -> Result<()> {
    if key != name {
        return Err(Error::layout(format!(
            "allocation key '{}' does not match its name '{}'",
            key, name
        )));
    }
    Ok(())
}

/// `offset + size`, or a layout error when the end does not fit in `usize`
fn checked_end(what: &str, offset: usize, size: usize) -> Result<usize> {
    offset.checked_add(size).ok_or_else(|| {
        Error::layout(format!(
            "allocation '{}' ends past the addressable range (offset {}, size {})",
            what, offset, size
        ))
    })
}

fn check_static_overlap(region: &StaticRegion) -> Result<()> {
    let mut spans: Vec<(usize, usize, &str)> = region
        .allocations
        .values()
        .filter(|a| a.size > 0)
        .map(|a| (a.offset, a.offset + a.size, a.name.as_str()))
        .collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        let (_, end, first) = pair[0];
        let (start, _, second) = pair[1];
        if start < end {
            return Err(Error::layout(format!(
                "static allocations '{}' and '{}' overlap",
                first, second
            )));
        }
    }
    Ok(())
}

fn check_aligned(what: &str, bytes: usize) -> Result<()> {
    if bytes % ELEMENT_SIZE != 0 {
        return Err(Error::layout(format!(
            "{} = {} is not a multiple of {} bytes",
            what, bytes, ELEMENT_SIZE
        )));
    }
    Ok(())
}
