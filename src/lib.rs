//!Tunnel a UDP stream between two hosts that can only make outbound HTTP connections.
//!
//!Direct UDP between the hosts is blocked, but both can reach a public relay over websocket.
//!
//!## How udpws works
//!Each host runs a bridge, which owns one local UDP socket bound to a fixed source/destination pair,
//!dials the relay and announces a session key as its first frame.
//!Every datagram read from the local socket becomes one websocket frame, and every frame from the relay
//!is written back to the local socket as one datagram.
//!
//!The relay pairs two bridges whose session keys are exact reverses of each other.
//!A connection announcing `K` is registered under `reverse(K)`, and its frames are forwarded to whoever
//!is registered under `K`, which is the bridge that announced `reverse(K)`.
//!This convention is all there is to pairing, both sides must agree on the keys out of band.
//!
//!Keys are the raw bytes of the first data frame and need not be UTF-8. They are reversed by
//!character, with every byte outside valid UTF-8 counted as one U+FFFD. A key holding such bytes is
//!therefore registered under a form that differs from its raw bytes, while its own frames are still
//!looked up by the raw bytes. Peers using such keys must announce the replaced form to be reachable.
//!
//!The relay forwards each frame as received, text or binary, and never checks text frames for
//!valid UTF-8. Datagrams are arbitrary bytes whichever kind of frame carries them.
//!
//!A newer connection registering under a taken key closes the older one, so a bridge that redials
//!replaces its own stale session. A connection silent for longer than the session timeout is dropped.
//!Frames with no registered peer are discarded, nothing is buffered.
//!
//!## Feature flags
//!- `client`: udp bridge
//!- `server`: rendezvous relay
//!
//!```toml
//!udpws = { version = "0.1", default-features=false, features=["client"]}
//!```

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;
pub mod session;
pub mod transport;
