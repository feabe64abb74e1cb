use async_trait::async_trait;
use sorng_ftp_client::ftp::connection::{BoxedStream, Connection, Transport};
use sorng_ftp_client::*;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

// ─── Test transport ──────────────────────────────────────────────────

enum DataPlan {
    Refuse,
    Hang,
    Accept(DuplexStream),
}

struct MockTransport {
    control: StdMutex<Option<DuplexStream>>,
    peer: SocketAddr,
    plans: StdMutex<VecDeque<DataPlan>>,
    attempts: StdMutex<Vec<SocketAddr>>,
}

impl MockTransport {
    fn attempts(&self) -> Vec<SocketAddr> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<Connection> {
        let stream = self
            .control
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "control used"))?;
        Ok(Connection {
            stream: Box::new(stream),
            peer: Some(self.peer),
        })
    }

    async fn connect_data(&self, addr: SocketAddr) -> io::Result<BoxedStream> {
        self.attempts.lock().unwrap().push(addr);
        let plan = self.plans.lock().unwrap().pop_front();
        match plan {
            Some(DataPlan::Accept(stream)) => Ok(Box::new(stream)),
            Some(DataPlan::Hang) => std::future::pending().await,
            Some(DataPlan::Refuse) | None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )),
        }
    }
}

// ─── Scripted server ─────────────────────────────────────────────────

struct Server {
    control: BufReader<DuplexStream>,
}

impl Server {
    async fn send(&mut self, text: &str) {
        self.control.get_mut().write_all(text.as_bytes()).await.unwrap();
    }

    async fn expect(&mut self, command: &str) {
        let mut line = String::new();
        let n = self.control.read_line(&mut line).await.unwrap();
        assert!(n > 0, "client closed while server expected {:?}", command);
        assert_eq!(line.trim_end(), command);
    }

    /// Asserts the client sends nothing for a while.
    async fn expect_silence(&mut self) {
        let mut line = String::new();
        let read = tokio::time::timeout(Duration::from_millis(50), self.control.read_line(&mut line)).await;
        assert!(read.is_err(), "unexpected command {:?}", line);
    }

    async fn login(&mut self) {
        self.send("220 Test FTP server ready\r\n").await;
        self.expect("USER anonymous").await;
        self.send("331 Please specify the password.\r\n").await;
        self.expect("PASS anonymous@").await;
        self.send("230 Login successful.\r\n").await;
        self.expect("FEAT").await;
        self.send("211-Features:\r\n SIZE\r\n MDTM\r\n MLST type*;size*;modify*;\r\n REST STREAM\r\n211 End\r\n")
            .await;
        self.expect("TYPE I").await;
        self.send("200 Switching to Binary mode.\r\n").await;
    }
}

fn peer() -> SocketAddr {
    "10.0.0.1:21".parse().unwrap()
}

fn test_config() -> FtpConnectionConfig {
    let mut config = FtpConnectionConfig::new("ftp.test");
    config.keepalive_interval_ms = 0;
    config
}

fn setup(plans: Vec<DataPlan>) -> (Arc<MockTransport>, Server) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let transport = Arc::new(MockTransport {
        control: StdMutex::new(Some(client_end)),
        peer: peer(),
        plans: StdMutex::new(plans.into_iter().collect()),
        attempts: StdMutex::new(Vec::new()),
    });
    (
        transport,
        Server {
            control: BufReader::new(server_end),
        },
    )
}

async fn logged_in(config: FtpConnectionConfig, plans: Vec<DataPlan>) -> (FtpClient, Server, Arc<MockTransport>) {
    let (transport, mut server) = setup(plans);
    let (client, ()) = tokio::join!(
        FtpClient::connect_with(config, transport.clone()),
        server.login()
    );
    (client.unwrap(), server, transport)
}

// ─── Login ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_login_sequence_and_features() {
    let (client, _server, _) = logged_in(test_config(), vec![]).await;

    assert_eq!(client.state(), SessionState::Authorized);
    assert_eq!(client.greeting().as_deref(), Some("Test FTP server ready"));
    let features = client.features();
    assert!(features.supports("SIZE"));
    assert!(features.supports("REST"));
    assert_eq!(features.param("MLST"), Some("type*;size*;modify*;"));

    let mut events = client.take_events().unwrap();
    assert!(matches!(events.recv().await, Some(SessionEvent::Greeting(g)) if g == "Test FTP server ready"));
    assert!(matches!(events.recv().await, Some(SessionEvent::Ready)));
    assert!(client.take_events().is_none());
}

#[tokio::test]
async fn test_feat_failure_is_swallowed() {
    let (transport, mut server) = setup(vec![]);
    let script = async {
        server.send("220 ready\r\n").await;
        server.expect("USER anonymous").await;
        server.send("230 No password needed\r\n").await;
        server.expect("FEAT").await;
        server.send("500 FEAT not understood\r\n").await;
        server.expect("TYPE I").await;
        server.send("200 ok\r\n").await;
    };
    let (client, ()) = tokio::join!(FtpClient::connect_with(test_config(), transport), script);
    let client = client.unwrap();

    assert!(client.features().is_empty());
    let err = client.size("file.bin").await.unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::Unsupported);
    server.expect_silence().await;
}

#[tokio::test]
async fn test_password_required_without_password() {
    let mut config = test_config();
    config.password = None;
    let (transport, mut server) = setup(vec![]);
    let script = async {
        server.send("220 ready\r\n").await;
        server.expect("USER anonymous").await;
        server.send("331 Password required\r\n").await;
    };
    let (result, ()) = tokio::join!(FtpClient::connect_with(config, transport), script);

    let err = result.err().unwrap();
    assert_eq!(err.kind, FtpErrorKind::AuthFailed);
    assert_eq!(err.code, Some(331));
    assert!(err.message.contains("Password required"));
}

#[tokio::test]
async fn test_rejected_password() {
    let (transport, mut server) = setup(vec![]);
    let script = async {
        server.send("220 ready\r\n").await;
        server.expect("USER anonymous").await;
        server.send("331 Password please\r\n").await;
        server.expect("PASS anonymous@").await;
        server.send("530 Login incorrect.\r\n").await;
    };
    let (result, ()) = tokio::join!(FtpClient::connect_with(test_config(), transport), script);

    let err = result.err().unwrap();
    assert_eq!(err.kind, FtpErrorKind::AuthFailed);
    assert_eq!(err.code, Some(530));
    assert!(err.is_protocol());
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let mut config = test_config();
    config.connect_timeout_ms = 50;
    let (transport, _server) = setup(vec![]);

    let err = FtpClient::connect_with(config, transport).await.err().unwrap();
    assert!(err.is_timeout());
}

// ─── Control commands ────────────────────────────────────────────────

#[tokio::test]
async fn test_commands_resolve_in_order() {
    let (client, mut server, _) = logged_in(test_config(), vec![]).await;

    let script = async {
        server.expect("PWD").await;
        server.expect_silence().await;
        server.send("257 \"/home/\"\"q\"\"\" is the current directory\r\n").await;
        server.expect("SYST").await;
        server.send("215 UNIX Type: L8\r\n").await;
        server.expect("NOOP").await;
        server.send("200 NOOP ok.\r\n").await;
    };
    let (pwd, system, noop, ()) = tokio::join!(client.pwd(), client.system(), client.noop(), script);

    assert_eq!(pwd.unwrap(), "/home/\"q\"");
    assert_eq!(system.unwrap(), "UNIX Type: L8");
    noop.unwrap();
}

#[tokio::test]
async fn test_multiline_reply_split_across_writes() {
    let (client, mut server, _) = logged_in(test_config(), vec![]).await;

    let script = async {
        server.expect("STAT").await;
        for chunk in ["211-Status of ", "ftp.test\r\n Connected\r", "\n211 End of status\r\n"] {
            server.send(chunk).await;
            tokio::task::yield_now().await;
        }
    };
    let (status, ()) = tokio::join!(client.status(None), script);

    let status = status.unwrap();
    assert!(status.starts_with("Status of ftp.test"));
    assert!(status.ends_with("End of status"));
}

#[tokio::test]
async fn test_rename_sends_rnto_after_rnfr() {
    let (client, mut server, _) = logged_in(test_config(), vec![]).await;

    let script = async {
        server.expect("RNFR old.txt").await;
        server.send("350 Ready for RNTO.\r\n").await;
        server.expect("RNTO new.txt").await;
        server.send("250 Rename successful.\r\n").await;
        server.expect("NOOP").await;
        server.send("200 ok\r\n").await;
    };
    let (renamed, noop, ()) = tokio::join!(client.rename("old.txt", "new.txt"), client.noop(), script);
    renamed.unwrap();
    noop.unwrap();
}

#[tokio::test]
async fn test_rename_stops_when_rnfr_fails() {
    let (client, mut server, _) = logged_in(test_config(), vec![]).await;

    let script = async {
        server.expect("RNFR missing.txt").await;
        server.send("550 missing.txt: No such file or directory\r\n").await;
        server.expect("NOOP").await;
        server.send("200 ok\r\n").await;
    };
    let (renamed, noop, ()) = tokio::join!(client.rename("missing.txt", "x"), client.noop(), script);

    assert_eq!(renamed.unwrap_err().kind, FtpErrorKind::NotFound);
    noop.unwrap();
}

#[tokio::test]
async fn test_directory_commands() {
    let (client, mut server, _) = logged_in(test_config(), vec![]).await;

    let script = async {
        server.expect("MKD docs").await;
        server.send("257 \"/docs\" created\r\n").await;
        server.expect("CWD docs").await;
        server.send("250 Directory changed\r\n").await;
        server.expect("CDUP").await;
        server.send("200 ok\r\n").await;
        server.expect("RMD docs").await;
        server.send("250 Removed\r\n").await;
        server.expect("DELE a.txt").await;
        server.send("550 Permission denied\r\n").await;
    };
    let run = async {
        assert_eq!(client.mkdir("docs").await.unwrap(), "/docs");
        client.cwd("docs").await.unwrap();
        client.cdup().await.unwrap();
        client.rmdir("docs").await.unwrap();
        client.delete("a.txt").await.unwrap_err()
    };
    let (err, ()) = tokio::join!(run, script);

    assert_eq!(err.kind, FtpErrorKind::PermissionDenied);
    assert_eq!(err.code, Some(550));
}

#[tokio::test]
async fn test_size_mdtm_and_mlst() {
    let (client, mut server, _) = logged_in(test_config(), vec![]).await;

    let script = async {
        server.expect("SIZE a.bin").await;
        server.send("213 1048576\r\n").await;
        server.expect("MDTM a.bin").await;
        server.send("213 20230415093012\r\n").await;
        server.expect("REST 100").await;
        server.send("350 Restarting at 100\r\n").await;
        server.expect("MLST a.bin").await;
        server.send("250-Listing a.bin\r\n type=file;size=1048576;modify=20230415093012; a.bin\r\n250 End\r\n")
            .await;
    };
    let run = async {
        let size = client.size("a.bin").await.unwrap();
        let modified = client.last_mod("a.bin").await.unwrap();
        client.restart(100).await.unwrap();
        let entry = client.mlst("a.bin").await.unwrap();
        (size, modified, entry)
    };
    let ((size, modified, entry), ()) = tokio::join!(run, script);

    assert_eq!(size, 1_048_576);
    assert_eq!(modified.to_rfc3339(), "2023-04-15T09:30:12+00:00");
    assert_eq!(entry.name, "a.bin");
    assert_eq!(entry.kind, EntryKind::File);
    assert_eq!(entry.size, 1_048_576);
}

// ─── Passive data connections ────────────────────────────────────────

#[tokio::test]
async fn test_list_over_passive_connection() {
    let (data_client, mut data_server) = tokio::io::duplex(4096);
    let (client, mut server, transport) = logged_in(test_config(), vec![DataPlan::Accept(data_client)]).await;

    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (10,0,0,1,19,137).\r\n").await;
        server.expect("LIST /pub").await;
        server.send("150 Here comes the directory listing.\r\n").await;
        data_server
            .write_all(
                b"total 2\r\n\
                  drwxr-xr-x  10 root   root    4096 Dec 21  2012 usr\r\n\
                  lrwxrwxrwx   1 root   root       7 Jan 01  2020 bin -> usr/bin\r\n\
                  something unexpected\r\n",
            )
            .await
            .unwrap();
        drop(data_server);
        server.send("226 Directory send OK.\r\n").await;
    };
    let (items, ()) = tokio::join!(client.list(Some("/pub")), script);

    let items = items.unwrap();
    assert_eq!(items.len(), 3);
    let usr = items[0].entry().unwrap();
    assert_eq!(usr.kind, EntryKind::Directory);
    assert_eq!(usr.name, "usr");
    assert_eq!(usr.size, 4096);
    let bin = items[1].entry().unwrap();
    assert_eq!(bin.name, "bin");
    assert_eq!(bin.target.as_deref(), Some("usr/bin"));
    assert_eq!(items[2], ListItem::Raw("something unexpected".into()));
    assert_eq!(transport.attempts(), vec!["10.0.0.1:5001".parse::<SocketAddr>().unwrap()]);
}

#[tokio::test]
async fn test_list_completes_when_reply_precedes_data_close() {
    let (data_client, mut data_server) = tokio::io::duplex(4096);
    let (client, mut server, _) = logged_in(test_config(), vec![DataPlan::Accept(data_client)]).await;

    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (10,0,0,1,4,0)\r\n").await;
        server.expect("LIST").await;
        server.send("150 Opening\r\n226 Transfer complete\r\n").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        data_server
            .write_all(b"-rw-r--r-- 1 ftp ftp 12 Mar 03  2021 late.txt\r\n")
            .await
            .unwrap();
        drop(data_server);
    };
    let (items, ()) = tokio::join!(client.list(None), script);

    let items = items.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].entry().unwrap().name, "late.txt");
}

#[tokio::test]
async fn test_passive_retry_against_control_peer_once() {
    let (data_client, mut data_server) = tokio::io::duplex(4096);
    let (client, mut server, transport) = logged_in(
        test_config(),
        vec![DataPlan::Refuse, DataPlan::Accept(data_client)],
    )
    .await;

    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (192,168,1,5,19,137)\r\n").await;
        server.expect("LIST").await;
        server.send("150 ok\r\n").await;
        data_server.write_all(b"-rw-r--r-- 1 u g 5 Jan 01  2020 a.txt\n").await.unwrap();
        drop(data_server);
        server.send("226 done\r\n").await;
    };
    let (items, ()) = tokio::join!(client.list(None), script);

    assert_eq!(items.unwrap().len(), 1);
    assert_eq!(
        transport.attempts(),
        vec![
            "192.168.1.5:5001".parse::<SocketAddr>().unwrap(),
            "10.0.0.1:5001".parse::<SocketAddr>().unwrap(),
        ]
    );
}

#[tokio::test]
async fn test_failed_data_connection_sends_abor_first() {
    let (client, mut server, transport) =
        logged_in(test_config(), vec![DataPlan::Refuse, DataPlan::Refuse]).await;

    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (192,168,1,5,19,137)\r\n").await;
        server.expect("ABOR").await;
        server.send("225 No transfer to ABOR.\r\n").await;
        server.expect("NOOP").await;
        server.send("200 ok\r\n").await;
    };
    let run = async {
        let err = client.list(None).await.unwrap_err();
        client.noop().await.unwrap();
        err
    };
    let (err, ()) = tokio::join!(run, script);

    assert_eq!(err.kind, FtpErrorKind::DataChannelFailed);
    assert!(err.message.starts_with("Unable to make data connection"));
    assert_eq!(transport.attempts().len(), 2);
}

#[tokio::test]
async fn test_no_retry_when_advertised_address_is_the_peer() {
    let (client, mut server, transport) = logged_in(test_config(), vec![DataPlan::Refuse]).await;

    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (10,0,0,1,19,137)\r\n").await;
        server.expect("ABOR").await;
        server.send("226 ABOR successful\r\n").await;
    };
    let (result, ()) = tokio::join!(client.list(None), script);

    assert_eq!(result.unwrap_err().kind, FtpErrorKind::DataChannelFailed);
    assert_eq!(transport.attempts().len(), 1);
}

#[tokio::test]
async fn test_data_connect_timeout_is_not_retried() {
    let mut config = test_config();
    config.data_timeout_ms = 50;
    let (client, mut server, transport) = logged_in(config, vec![DataPlan::Hang]).await;

    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (192,168,1,5,19,137)\r\n").await;
        server.expect("NOOP").await;
        server.send("200 ok\r\n").await;
    };
    let run = async {
        let err = client.list(None).await.unwrap_err();
        client.noop().await.unwrap();
        err
    };
    let (err, ()) = tokio::join!(run, script);

    assert!(err.is_timeout());
    assert_eq!(err.message, "Timed out while making data connection");
    assert_eq!(transport.attempts().len(), 1);
}

#[tokio::test]
async fn test_extended_passive_uses_control_peer() {
    let mut config = test_config();
    config.passive_mode = PassiveMode::ExtendedPassive;
    let (data_client, data_server) = tokio::io::duplex(4096);
    let (client, mut server, transport) = logged_in(config, vec![DataPlan::Accept(data_client)]).await;

    let script = async {
        server.expect("EPSV").await;
        server.send("229 Entering Extended Passive Mode (|||6000|)\r\n").await;
        server.expect("LIST").await;
        server.send("150 ok\r\n").await;
        drop(data_server);
        server.send("226 done\r\n").await;
    };
    let (items, ()) = tokio::join!(client.list(None), script);

    assert!(items.unwrap().is_empty());
    assert_eq!(transport.attempts(), vec!["10.0.0.1:6000".parse::<SocketAddr>().unwrap()]);
}

// ─── Transfers ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_download_into_writer() {
    let (data_client, mut data_server) = tokio::io::duplex(4096);
    let (client, mut server, _) = logged_in(test_config(), vec![DataPlan::Accept(data_client)]).await;

    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (10,0,0,1,4,1)\r\n").await;
        server.expect("RETR hello.txt").await;
        server.send("150 Opening BINARY mode data connection\r\n").await;
        data_server.write_all(b"hello world").await.unwrap();
        drop(data_server);
        server.send("226 Transfer complete\r\n").await;
    };
    let mut sink = Vec::new();
    let (bytes, ()) = tokio::join!(client.get_into("hello.txt", &mut sink), script);

    assert_eq!(bytes.unwrap(), 11);
    assert_eq!(sink, b"hello world");
}

#[tokio::test]
async fn test_download_of_missing_file() {
    let (data_client, _data_server) = tokio::io::duplex(4096);
    let (client, mut server, _) = logged_in(test_config(), vec![DataPlan::Accept(data_client)]).await;

    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (10,0,0,1,4,1)\r\n").await;
        server.expect("RETR nope.txt").await;
        server.send("550 Failed to open file: No such file\r\n").await;
    };
    let (result, ()) = tokio::join!(client.get("nope.txt"), script);

    let err = result.err().unwrap();
    assert_eq!(err.kind, FtpErrorKind::NotFound);
    assert_eq!(err.code, Some(550));
}

#[tokio::test]
async fn test_upload_and_append() {
    let (store_client, mut store_server) = tokio::io::duplex(4096);
    let (append_client, mut append_server) = tokio::io::duplex(4096);
    let (client, mut server, _) = logged_in(
        test_config(),
        vec![DataPlan::Accept(store_client), DataPlan::Accept(append_client)],
    )
    .await;

    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (10,0,0,1,4,2)\r\n").await;
        server.expect("STOR up.txt").await;
        server.send("150 Ok to send data.\r\n").await;
        let mut received = Vec::new();
        store_server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"first");
        server.send("226 Transfer complete.\r\n").await;

        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (10,0,0,1,4,3)\r\n").await;
        server.expect("APPE up.txt").await;
        server.send("150 Ok to send data.\r\n").await;
        received.clear();
        append_server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b", second");
        server.send("226 Transfer complete.\r\n").await;
    };
    let run = async {
        let stored = client.put(&mut &b"first"[..], "up.txt").await.unwrap();
        let appended = client.append(&mut &b", second"[..], "up.txt").await.unwrap();
        (stored, appended)
    };
    let ((stored, appended), ()) = tokio::join!(run, script);

    assert_eq!(stored, 5);
    assert_eq!(appended, 8);
}

#[tokio::test]
async fn test_abort_during_download() {
    let (data_client, mut data_server) = tokio::io::duplex(4096);
    let (client, mut server, _) = logged_in(test_config(), vec![DataPlan::Accept(data_client)]).await;

    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (10,0,0,1,4,4)\r\n").await;
        server.expect("RETR big.iso").await;
        server.send("150 Opening data connection\r\n").await;
        data_server.write_all(b"abc").await.unwrap();
        let mut rest = Vec::new();
        let _ = data_server.read_to_end(&mut rest).await;
        server.send("426 Connection closed; transfer aborted.\r\n").await;
        server.expect("ABOR").await;
        server.send("226 Abort successful\r\n").await;
    };
    let run = async {
        let mut transfer = client.get("big.iso").await.unwrap();
        let mut head = [0u8; 3];
        transfer.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"abc");

        let aborter = client.clone();
        let abort = tokio::spawn(async move { aborter.abort().await });
        while !transfer.is_aborting() {
            tokio::task::yield_now().await;
        }
        let outcome = transfer.finish().await;
        (outcome, abort.await.unwrap())
    };
    let ((outcome, abort), ()) = tokio::join!(run, script);

    assert_eq!(outcome.unwrap(), TransferOutcome::Aborted);
    abort.unwrap();
}

#[tokio::test]
async fn test_abort_while_passive_reply_outstanding() {
    let (data_client, _data_server) = tokio::io::duplex(4096);
    let (client, mut server, transport) = logged_in(test_config(), vec![DataPlan::Accept(data_client)]).await;

    let aborter = client.clone();
    let script = async {
        server.expect("PASV").await;
        let abort = tokio::spawn(async move { aborter.abort().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.send("227 Entering Passive Mode (10,0,0,1,4,0)\r\n").await;
        server.expect("ABOR").await;
        server.send("225 No transfer to abort\r\n").await;
        server.expect_silence().await;
        abort.await.unwrap()
    };
    let (items, abort) = tokio::join!(client.list(None), script);

    assert!(items.unwrap().is_empty());
    abort.unwrap();
    assert!(transport.attempts().is_empty());
}

#[tokio::test]
async fn test_abort_while_data_connection_pending() {
    let mut config = test_config();
    config.data_timeout_ms = 100;
    let (client, mut server, transport) = logged_in(config, vec![DataPlan::Hang]).await;

    let aborter = client.clone();
    let script = async {
        server.expect("PASV").await;
        server.send("227 Entering Passive Mode (10,0,0,1,4,0)\r\n").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let abort = tokio::spawn(async move { aborter.abort().await });
        server.expect("ABOR").await;
        server.send("225 No transfer to abort\r\n").await;
        server.expect_silence().await;
        abort.await.unwrap()
    };
    let (outcome, abort) = tokio::join!(
        async {
            let mut transfer = client.get("big.iso").await?;
            let mut sink = Vec::new();
            transfer.copy_to(&mut sink).await?;
            transfer.finish().await
        },
        script
    );

    assert_eq!(outcome.unwrap(), TransferOutcome::Aborted);
    abort.unwrap();
    assert_eq!(transport.attempts().len(), 1);
}

// ─── Session lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn test_end_closes_session() {
    let (client, _server, _) = logged_in(test_config(), vec![]).await;
    let mut events = client.take_events().unwrap();

    client.end();
    loop {
        match events.recv().await {
            Some(SessionEvent::Closed { had_error }) => {
                assert!(!had_error);
                break;
            }
            Some(_) => continue,
            None => panic!("event channel closed before Closed"),
        }
    }

    assert_eq!(client.state(), SessionState::Closed);
    let err = client.pwd().await.unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::InvalidState);
}

#[tokio::test]
async fn test_server_hangup_fails_pending_command() {
    let (client, mut server, _) = logged_in(test_config(), vec![]).await;
    let mut events = client.take_events().unwrap();

    let script = async move {
        server.expect("NOOP").await;
        drop(server);
    };
    let (result, ()) = tokio::join!(client.noop(), script);

    let err = result.unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::Disconnected);
    assert!(err.is_transport());

    let mut saw_end = false;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::End => saw_end = true,
            SessionEvent::Closed { .. } => break,
            _ => {}
        }
    }
    assert!(saw_end);
}

#[tokio::test]
async fn test_oversized_reply_fails_session() {
    let mut config = test_config();
    config.max_reply_bytes = 4096;
    let (client, mut server, _) = logged_in(config, vec![]).await;

    let script = async {
        server.expect("NOOP").await;
        server.send("200-").await;
        server.send(&"x".repeat(8192)).await;
    };
    let (result, ()) = tokio::join!(client.noop(), script);

    let err = result.unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::ParseError);
    assert_eq!(client.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_keepalive_sends_noop_when_idle() {
    let mut config = test_config();
    config.keepalive_interval_ms = 30;
    let (client, mut server, _) = logged_in(config, vec![]).await;

    server.expect("NOOP").await;
    server.send("200 still here\r\n").await;
    assert!(client.is_connected());
}
