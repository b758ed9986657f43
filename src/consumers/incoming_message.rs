/// A dequeued message, ready for processing.
///
/// `Incoming` is the input type of message handlers (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
///
/// The acknowledgement handle stays with the consumer: handlers cannot settle the message
/// themselves, so it is never settled twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// The payload of the message, as received from the broker.
    pub body: Vec<u8>,
    /// The broker-assigned tag of this delivery.
    pub delivery_tag: u64,
    /// `true` if the message was delivered before and requeued, e.g. after a failed attempt
    /// or a connection loss.
    pub redelivered: bool,
    /// The name of the queue.
    pub queue_name: String,
}
