use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where a tensor's storage lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host memory
    Cpu,
    /// Device-resident memory managed by the host, by device index
    Accelerator(u32),
}

/// A tensor-like buffer produced by a node.
///
/// Only the metadata needed for size accounting is tracked; two outputs that
/// share the same `Arc<Tensor>` share storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    /// Dimensions
    pub shape: Vec<usize>,
    /// Bytes per element
    pub element_size: usize,
    /// Storage location
    pub device: Device,
}

impl Tensor {
    /// Create a host tensor
    pub fn new(shape: Vec<usize>, element_size: usize) -> Self {
        Self {
            shape,
            element_size,
            device: Device::Cpu,
        }
    }

    /// Move the tensor description to another device
    pub fn on(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Number of elements
    pub fn numel(&self) -> u64 {
        self.shape.iter().map(|d| *d as u64).product()
    }

    /// Storage size in bytes
    pub fn nbytes(&self) -> u64 {
        self.numel() * self.element_size as u64
    }
}

/// One value in a node's output slots
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    /// Shared tensor storage
    Tensor(Arc<Tensor>),
    /// Text
    Text(String),
    /// Any JSON scalar or structure
    Scalar(Value),
    /// Ordered collection
    List(Vec<OutputValue>),
    /// Keyed collection
    Map(BTreeMap<String, OutputValue>),
}

impl OutputValue {
    /// Wrap a tensor
    pub fn tensor(tensor: Tensor) -> Self {
        OutputValue::Tensor(Arc::new(tensor))
    }

    fn accumulate(&self, footprint: &mut MemoryFootprint) {
        match self {
            OutputValue::Tensor(tensor) => {
                footprint
                    .buffers
                    .insert(Arc::as_ptr(tensor) as usize, tensor.nbytes());
            }
            OutputValue::Text(text) => footprint.inline_bytes += text.len() as u64,
            OutputValue::Scalar(value) => footprint.inline_bytes += value.to_string().len() as u64,
            OutputValue::List(items) => items.iter().for_each(|item| item.accumulate(footprint)),
            OutputValue::Map(items) => items.values().for_each(|item| item.accumulate(footprint)),
        }
    }
}

/// Memory held by a value: shared buffers by identity, plus unshared bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryFootprint {
    /// Distinct shared buffers, keyed by storage identity
    pub buffers: BTreeMap<usize, u64>,
    /// Bytes owned exclusively by the value
    pub inline_bytes: u64,
}

impl MemoryFootprint {
    /// Size counting each shared buffer once
    pub fn logical_size(&self) -> u64 {
        self.buffers.values().sum::<u64>() + self.inline_bytes
    }
}

/// The cached result of executing one node: its output slots in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// Output slots
    pub slots: Vec<OutputValue>,
}

impl NodeOutput {
    /// Create an output from its slots
    pub fn new(slots: Vec<OutputValue>) -> Self {
        Self { slots }
    }

    /// Output with a single slot
    pub fn single(value: OutputValue) -> Self {
        Self { slots: vec![value] }
    }

    /// Value of one slot
    pub fn slot(&self, index: usize) -> Option<&OutputValue> {
        self.slots.get(index)
    }

    /// Memory footprint with shared buffers counted once for this output
    pub fn footprint(&self) -> MemoryFootprint {
        let mut footprint = MemoryFootprint::default();
        for slot in &self.slots {
            slot.accumulate(&mut footprint);
        }
        footprint
    }

    /// Logical size in bytes
    pub fn logical_size(&self) -> u64 {
        self.footprint().logical_size()
    }
}
