//! Tests for the egress dispatcher over an in-memory transport

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use crate::conn::{Link, LINK_CAPACITY};
    use crate::frame::{Frame, OpenRequest, Opcode};
    use crate::relay::{EgressDispatcher, RelayOption};
    use crate::tests::support::{
        closed_port, echo_server, greeting_server, next_frame, send_frame, WAIT,
    };

    fn dispatcher() -> (EgressDispatcher, Link) {
        let (client, egress) = Link::pair(LINK_CAPACITY);
        let options = RelayOption::default().with_connect_timeout(Duration::from_secs(2));
        (EgressDispatcher::spawn(options, egress), client)
    }

    fn open_frame(id: u64, port: u16) -> Frame {
        let payload = OpenRequest::new("127.0.0.1", port).encode().unwrap();
        Frame::new(id, Opcode::Open, payload)
    }

    /// Nothing else arrives on `link` for a short while
    async fn assert_quiet(link: &mut Link) {
        let next = timeout(Duration::from_millis(100), link.inbound.recv()).await;
        assert!(next.is_err(), "unexpected message: {:?}", next);
    }

    #[tokio::test]
    async fn test_open_acknowledges_and_relays() {
        let port = echo_server().await;
        let (dispatcher, mut client) = dispatcher();

        send_frame(&client, open_frame(7, port)).await;
        assert_eq!(next_frame(&mut client).await, Frame::empty(7, Opcode::Open));
        assert!(dispatcher.sockets().contains(7));

        send_frame(&client, Frame::new(7, Opcode::Data, b"abc".to_vec())).await;
        assert_eq!(
            next_frame(&mut client).await,
            Frame::new(7, Opcode::Data, b"abc".to_vec())
        );
    }

    #[tokio::test]
    async fn test_dial_failure_replies_close() {
        let port = closed_port().await;
        let (dispatcher, mut client) = dispatcher();

        send_frame(&client, open_frame(8, port)).await;
        assert_eq!(next_frame(&mut client).await, Frame::empty(8, Opcode::Close));
        assert!(!dispatcher.sockets().contains(8));
        assert_quiet(&mut client).await;
    }

    #[tokio::test]
    async fn test_remote_close_sends_exactly_one_close() {
        let port = greeting_server(b"hi").await;
        let (dispatcher, mut client) = dispatcher();

        send_frame(&client, open_frame(9, port)).await;
        assert_eq!(next_frame(&mut client).await, Frame::empty(9, Opcode::Open));
        assert_eq!(
            next_frame(&mut client).await,
            Frame::new(9, Opcode::Data, b"hi".to_vec())
        );
        assert_eq!(next_frame(&mut client).await, Frame::empty(9, Opcode::Close));
        assert_quiet(&mut client).await;
        assert!(dispatcher.sockets().is_empty());

        // The id is gone; further DATA is refused
        send_frame(&client, Frame::new(9, Opcode::Data, b"late".to_vec())).await;
        assert_eq!(next_frame(&mut client).await, Frame::empty(9, Opcode::Close));
    }

    #[tokio::test]
    async fn test_duplicate_open_is_refused() {
        let port = echo_server().await;
        let (dispatcher, mut client) = dispatcher();

        send_frame(&client, open_frame(10, port)).await;
        assert_eq!(next_frame(&mut client).await, Frame::empty(10, Opcode::Open));

        send_frame(&client, open_frame(10, port)).await;
        assert_eq!(next_frame(&mut client).await, Frame::empty(10, Opcode::Close));
        assert_eq!(dispatcher.sockets().len(), 1);

        // The first socket still works
        send_frame(&client, Frame::new(10, Opcode::Data, b"still".to_vec())).await;
        assert_eq!(
            next_frame(&mut client).await,
            Frame::new(10, Opcode::Data, b"still".to_vec())
        );
    }

    #[tokio::test]
    async fn test_data_for_unknown_tunnel_creates_no_socket() {
        let (dispatcher, mut client) = dispatcher();

        send_frame(&client, Frame::new(11, Opcode::Data, b"x".to_vec())).await;
        assert_eq!(next_frame(&mut client).await, Frame::empty(11, Opcode::Close));
        assert!(dispatcher.sockets().is_empty());
    }

    #[tokio::test]
    async fn test_client_close_is_ignored() {
        let port = echo_server().await;
        let (dispatcher, mut client) = dispatcher();

        send_frame(&client, open_frame(12, port)).await;
        assert_eq!(next_frame(&mut client).await, Frame::empty(12, Opcode::Open));

        send_frame(&client, Frame::empty(12, Opcode::Close)).await;
        assert_quiet(&mut client).await;
        assert!(dispatcher.sockets().contains(12));
    }

    #[tokio::test]
    async fn test_malformed_open_replies_close() {
        let (dispatcher, mut client) = dispatcher();

        send_frame(&client, Frame::new(13, Opcode::Open, vec![200, b'x'])).await;
        assert_eq!(next_frame(&mut client).await, Frame::empty(13, Opcode::Close));
        assert!(dispatcher.sockets().is_empty());
    }

    #[tokio::test]
    async fn test_transport_end_closes_egress_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (dispatcher, mut client) = dispatcher();

        send_frame(&client, open_frame(14, port)).await;
        let (mut target, _) = listener.accept().await.unwrap();
        assert_eq!(next_frame(&mut client).await, Frame::empty(14, Opcode::Open));

        drop(client);
        let mut buf = [0u8; 1];
        let read = timeout(WAIT, target.read(&mut buf)).await.unwrap();
        assert_eq!(read.unwrap(), 0);
        assert!(dispatcher.sockets().is_empty());
    }

    #[tokio::test]
    async fn test_egress_meter_counts_frames() {
        let port = echo_server().await;
        let (dispatcher, mut client) = dispatcher();

        send_frame(&client, open_frame(15, port)).await;
        next_frame(&mut client).await;

        let (_, down) = dispatcher.meter().totals();
        assert_eq!(down as usize, 16 + 1 + "127.0.0.1".len() + 2);
    }
}
