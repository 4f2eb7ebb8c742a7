//! PDV streaming: outbound slicing and inbound reassembly.
//!
//! [`PdvWriter`] turns the byte stream of one DIMSE message into PDVs and
//! P-DATA-TF PDUs under the negotiated size caps; [`Reassembler`] performs
//! the inverse, reconstructing command and dataset streams per presentation
//! context and materializing complete messages.

mod reassembler;
mod writer;

pub use reassembler::{IncomingDimse, Reassembler, ReassemblyOutcome};
pub use writer::{PduSink, PdvWriter};

#[cfg(test)]
mod tests;
