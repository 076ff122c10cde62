use async_trait::async_trait;

use crate::error::TransportError;

/// A handle to a previously-constructed collective group of exactly two
/// ranks, used for point-to-point broadcasts between adjacent pipeline
/// stages (§4.6, external collaborator: collective transport primitive).
///
/// Opaque on purpose: backends attach whatever session state they need
/// (socket, NCCL communicator, in-process channel pair) and this crate only
/// ever threads the handle back into [`CollectiveTransport::broadcast`].
pub trait Group: Send + Sync + std::fmt::Debug {
    /// The two ranks that are members of this group, smaller first.
    fn members(&self) -> (usize, usize);

    /// Downcast support for backends whose `broadcast` needs the concrete
    /// group type back (e.g. to reach a per-edge channel stored on it).
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Which of the two independent sub-groups formed for an edge a handle
/// belongs to. Forward activations and backward gradients must never share
/// a channel: with one background worker per tensor name running
/// concurrently (§4.4), two workers sharing a single untagged channel could
/// dequeue each other's shape/payload frames. Threading this (and the tensor
/// tag) through group construction keeps every `(edge, tensor, direction)`
/// triple on its own wire (§3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

/// The external collaborator that performs the actual collective
/// communication this crate schedules. Out of scope to implement the wire
/// protocol for a real accelerator fabric here (§1 Non-goals): this trait is
/// the seam a real NCCL/Gloo/TCP backend plugs into.
#[async_trait]
pub trait CollectiveTransport: Send + Sync {
    /// This process's rank and the total world size, as seen by the transport.
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Gather one value of type `T` from every rank, in rank order. All
    /// ranks must call this the same number of times in the same order
    /// (§4.2): it is the building block the deterministic transport-group
    /// construction protocol is made of.
    async fn all_gather_u32(&self, value: u32) -> Result<Vec<u32>, TransportError>;

    /// Gather a fixed-width row of `i64` values from every rank, in rank
    /// order, into an N x `row.len()` matrix. Every rank must pass a row of
    /// the same width.
    async fn all_gather_rows(&self, row: &[i64]) -> Result<Vec<Vec<i64>>, TransportError>;

    /// Construct (or look up) a two-member collective group for one tensor's
    /// traffic in one direction. Must be called in the same order, with the
    /// same `(lo, hi, tag, direction)` tuples, on every rank that is a member
    /// of any group formed this run, so that group identities line up across
    /// the fleet (§4.2). Every distinct `(lo, hi, tag, direction)` gets its
    /// own backend channel — two tensors, or the forward and backward halves
    /// of the same edge, never share one.
    fn new_group(
        &self,
        lo: usize,
        hi: usize,
        tag: u32,
        direction: Direction,
    ) -> Result<Box<dyn Group>, TransportError>;

    /// Broadcast raw bytes from `root` to the other member of `group`. The
    /// caller on the sending side passes the payload; the caller on the
    /// receiving side ignores `payload` and uses the returned bytes.
    async fn broadcast(
        &self,
        group: &dyn Group,
        root: usize,
        payload: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, TransportError>;
}
