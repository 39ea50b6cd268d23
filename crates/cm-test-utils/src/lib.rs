// cm-test-utils: shared test endpoints for the federation integration
// suites.
//
// Provides a framed TCP stream plus client and peer wrappers that drive
// the connect handshakes, so tests exercise a node exactly the way a real
// counterpart would.

pub mod framed;
pub mod test_client;
pub mod test_peer;

pub use framed::FramedStream;
pub use test_client::TestClient;
pub use test_peer::TestPeer;
