/*!
    the process image: the memory both sides of the cyclic exchange agree on.

    It is a pair of contiguous buffers, one per direction. Each slave taking
    part in the cyclic exchange owns one segment in each, allocated
    sequentially at configuration time so segments never overlap. During a
    cycle the master writes every output segment to its slave and reads every
    input segment back, so the buffers are the application's complete view of
    the machine at the start of the cycle.
*/

use crate::data::{BusData, Field, PackingResult};


/// one slave's slice of a process image direction
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Segment {
    pub offset: usize,
    pub len: usize,
}
impl Segment {
    pub fn is_empty(&self) -> bool {self.len == 0}
    /// end offset, one past the last byte
    pub fn end(&self) -> usize {self.offset + self.len}
    /// rebase a field given relative to this segment onto the whole image
    pub fn field<T: BusData>(&self, field: Field<T>) -> Field<T> {
        Field::new(self.offset + field.byte, field.len)
    }
}

/// both directions of one slave's process data
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ImageRegion {
    /// written by the master, applied by the slave
    pub output: Segment,
    /// produced by the slave, read by the master
    pub input: Segment,
}

/**
    contiguous exchange buffers with sequential per-slave allocation.

    Allocation happens once, while slaves are being declared; the buffers then
    keep a fixed size for the life of the master, which is what lets a cycle
    run without allocating.
*/
#[derive(Default)]
pub struct ProcessImage {
    outputs: Vec<u8>,
    inputs: Vec<u8>,
}

impl ProcessImage {
    pub fn new() -> Self {Self::default()}

    /// reserve the next segments for a slave exchanging the given byte counts
    pub fn allocate(&mut self, output_len: usize, input_len: usize) -> ImageRegion {
        let region = ImageRegion {
            output: Segment {offset: self.outputs.len(), len: output_len},
            input: Segment {offset: self.inputs.len(), len: input_len},
        };
        self.outputs.resize(self.outputs.len() + output_len, 0);
        self.inputs.resize(self.inputs.len() + input_len, 0);
        region
    }

    /// total byte size of the output direction
    pub fn outputs_len(&self) -> usize {self.outputs.len()}
    /// total byte size of the input direction
    pub fn inputs_len(&self) -> usize {self.inputs.len()}

    /// one slave's output bytes, to be filled before the next cycle
    pub fn outputs_mut(&mut self, region: &ImageRegion) -> &mut [u8] {
        &mut self.outputs[region.output.offset .. region.output.end()]
    }
    /// one slave's output bytes as sent during the last cycle
    pub fn outputs(&self, region: &ImageRegion) -> &[u8] {
        &self.outputs[region.output.offset .. region.output.end()]
    }
    /// one slave's input bytes as read during the last cycle
    pub fn inputs(&self, region: &ImageRegion) -> &[u8] {
        &self.inputs[region.input.offset .. region.input.end()]
    }
    /// overwrite one slave's input bytes, used when distributing a cycle response
    pub(crate) fn inputs_mut(&mut self, region: &ImageRegion) -> &mut [u8] {
        &mut self.inputs[region.input.offset .. region.input.end()]
    }

    /// typed write into a slave's output segment, the field offset is relative to the segment
    pub fn set_output<T: BusData>(&mut self, region: &ImageRegion, field: Field<T>, value: T) -> PackingResult<()> {
        region.output.field(field).set(&mut self.outputs, value)
    }
    /// typed read from a slave's input segment, the field offset is relative to the segment
    pub fn get_input<T: BusData>(&self, region: &ImageRegion, field: Field<T>) -> PackingResult<T> {
        region.input.field(field).get(&self.inputs)
    }
}
