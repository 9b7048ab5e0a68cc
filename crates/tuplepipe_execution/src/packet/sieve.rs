use std::sync::Arc;

use tuplepipe_error::Result;

use super::{check_input_size, Packet, PacketKind, PacketRef};
use crate::buffer::{BufferOptions, TupleBuffer};
use crate::operators::Sieve;
use crate::query::QueryState;
use crate::scheduler::StageKind;
use crate::tuple::Tuple;

#[derive(Debug)]
pub struct SieveStage {
    sieve: Box<dyn Sieve>,
}

impl Packet {
    /// Pass every tuple of `input` through `sieve`.
    ///
    /// Replicated workers each flush their own sieve copy at end of input.
    pub fn sieve(
        name: impl Into<String>,
        opts: BufferOptions,
        input: PacketRef,
        sieve: Box<dyn Sieve>,
    ) -> Result<PacketRef> {
        let name = name.into();
        check_input_size(&name, &input, sieve.input_size())?;
        let output_size = sieve.output_size();
        Packet::build(
            name,
            output_size,
            opts,
            vec![input],
            PacketKind::Sieve(SieveStage { sieve }),
        )
    }
}

impl SieveStage {
    pub(super) fn start(&self, packet: &Packet, qs: &Arc<QueryState>) -> Result<()> {
        let stage = packet.stage_info(StageKind::Sieve, true, qs);
        let input = packet.input(0).output().clone();
        let output = packet.output().clone();

        packet.spawn_producers(qs, &stage, |_, _| {
            let input = input.clone();
            let output = output.clone();
            let sieve = self.sieve.clone();
            move || run_sieve(&input, &output, sieve)
        })
    }
}

fn run_sieve(input: &TupleBuffer, output: &TupleBuffer, mut sieve: Box<dyn Sieve>) -> Result<()> {
    let size = sieve.output_size();

    while let Some(tuple) = input.get()? {
        let mut dest = Tuple::zeroed(size);
        if sieve.pass(&mut dest, &tuple)? && !output.put(dest)? {
            input.detach_consumer();
            return Ok(());
        }
    }

    let mut dest = Tuple::zeroed(size);
    if sieve.flush(&mut dest)? {
        output.put(dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::FnSieve;
    use crate::packet::testutil::*;

    /// Emits the product of both fields and a trailing row count.
    #[derive(Debug, Clone)]
    struct ProductSieve {
        rows: i32,
    }

    impl Sieve for ProductSieve {
        fn input_size(&self) -> usize {
            8
        }

        fn output_size(&self) -> usize {
            4
        }

        fn pass(&mut self, dest: &mut Tuple, src: &Tuple) -> Result<bool> {
            self.rows += 1;
            let product = src.read_i32(0)? * src.read_i32(4)?;
            dest.write_i32(0, product)?;
            Ok(product != 0)
        }

        fn flush(&mut self, dest: &mut Tuple) -> Result<bool> {
            dest.write_i32(0, -self.rows)?;
            Ok(true)
        }
    }

    #[test]
    fn passes_and_flushes() {
        let scan = kv_scan("scan", &[(2, 3), (0, 5), (4, 4)]);
        let packet = Packet::sieve(
            "sieve",
            BufferOptions::default(),
            scan,
            Box::new(ProductSieve { rows: 0 }),
        )
        .unwrap();
        packet.set_parallelism(1);

        let out: Vec<_> = run(&packet)
            .unwrap()
            .iter()
            .map(|t| t.read_i32(0).unwrap())
            .collect();
        assert_eq!(vec![6, 16, -3], out);
    }

    #[test]
    fn replicated_sieve() {
        let rows: Vec<_> = (1..=200).map(|i| (i, 2)).collect();
        let scan = kv_scan("scan", &rows);
        let sieve = FnSieve::new(8, 4, |dest, src| {
            dest.write_i32(0, src.read_i32(0)? + src.read_i32(4)?)?;
            Ok(true)
        });
        let packet = Packet::sieve("sieve", BufferOptions::default(), scan, Box::new(sieve))
            .unwrap();
        packet.set_parallelism(3);

        let mut out: Vec<_> = run(&packet)
            .unwrap()
            .iter()
            .map(|t| t.read_i32(0).unwrap())
            .collect();
        out.sort();
        assert_eq!((3..=202).collect::<Vec<_>>(), out);
    }
}
