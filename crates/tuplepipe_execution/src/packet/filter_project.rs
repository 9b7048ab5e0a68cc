use std::sync::Arc;

use tuplepipe_error::Result;

use super::{check_input_size, Packet, PacketKind, PacketRef};
use crate::buffer::{BufferOptions, TupleBuffer};
use crate::operators::Filter;
use crate::query::QueryState;
use crate::scheduler::StageKind;
use crate::tuple::Tuple;

#[derive(Debug)]
pub struct FilterProjectStage {
    filter: Box<dyn Filter>,
}

impl Packet {
    /// Select and project every tuple of `input`.
    ///
    /// The stage is replicable, each worker gets its own copy of the filter.
    pub fn filter_project(
        name: impl Into<String>,
        opts: BufferOptions,
        input: PacketRef,
        filter: Box<dyn Filter>,
    ) -> Result<PacketRef> {
        let name = name.into();
        check_input_size(&name, &input, filter.input_size())?;
        let output_size = filter.output_size();
        Packet::build(
            name,
            output_size,
            opts,
            vec![input],
            PacketKind::FilterProject(FilterProjectStage { filter }),
        )
    }
}

impl FilterProjectStage {
    pub(super) fn start(&self, packet: &Packet, qs: &Arc<QueryState>) -> Result<()> {
        let stage = packet.stage_info(StageKind::FilterProject, true, qs);
        let input = packet.input(0).output().clone();
        let output = packet.output().clone();

        packet.spawn_producers(qs, &stage, |_, _| {
            let input = input.clone();
            let output = output.clone();
            let filter = self.filter.clone();
            move || run_filter(&input, &output, filter)
        })
    }
}

fn run_filter(input: &TupleBuffer, output: &TupleBuffer, mut filter: Box<dyn Filter>) -> Result<()> {
    while let Some(tuple) = input.get()? {
        if !emit_filtered(filter.as_mut(), output, &tuple)? {
            input.detach_consumer();
            break;
        }
    }
    Ok(())
}

/// Run `tuple` through `filter` and put the projection into `output`.
///
/// Returns false once `output` has no consumer left.
pub(super) fn emit_filtered(
    filter: &mut dyn Filter,
    output: &TupleBuffer,
    tuple: &Tuple,
) -> Result<bool> {
    if !filter.select(tuple)? {
        return Ok(true);
    }
    let mut dest = Tuple::zeroed(filter.output_size());
    filter.project(&mut dest, tuple)?;
    output.put(dest)
}
