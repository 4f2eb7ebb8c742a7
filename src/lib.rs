//! Asynchronous DICOM upper layer (PS 3.8) and DIMSE (PS 3.7) engine.
//!
//! This crate implements the association state machine, PDU framing, PDV
//! fragmentation, and the message exchange that sits between a reliable
//! byte stream and DICOM service roles. Transports, dataset codecs,
//! storage backends, and loggers stay outside; the engine reaches them
//! through the collaborator traits in [`store`], [`transcode`], and the
//! handler traits in [`service`].

pub mod association;
pub mod dimse;
pub mod error;
pub mod pdu;
pub mod pdv;
pub mod service;
pub mod store;
pub mod transcode;
pub mod uids;

pub use association::{
    AcceptAllPolicy,
    Association,
    ContextPolicy,
    ContextState,
    ContextVerdict,
    PresentationContext,
};
pub use dimse::{
    CommandField,
    CommandSet,
    Dataset,
    DimseMessage,
    FileMetaInformation,
    Priority,
    Status,
    StatusState,
};
pub use error::{Error, ProtocolError, Result, StoreError, TranscodeError};
pub use pdu::{Pdu, ProposedContext};
pub use service::{
    AssociationRequest,
    AssociationVerdict,
    CEchoProvider,
    CFindProvider,
    CMoveProvider,
    CStoreProvider,
    NServiceProvider,
    ProviderHandler,
    ProviderResponse,
    ResponseStream,
    ServiceHandle,
    ServiceHandlers,
    ServiceOptions,
    UpperLayerService,
    UserHandler,
    response_channel,
};
pub use store::{DicomFile, StoreSink, StoreSinkProvider, TempFileStoreProvider};
pub use transcode::{DatasetCodec, IdentityCodec};
