//! Fetches `/` from a host given on the command line and prints the
//! response.
//!
//! ```text
//! cargo run --example fetch -- example.org
//! ```

use std::any::Any;
use std::io::Read;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Sender};

use sluse::context::ExchangeContext;
use sluse::executor::WorkerPool;
use sluse::handler::ClientHandler;
use sluse::message::{HttpRequest, HttpResponse, Method};
use sluse::protocol::{LoggingEventListener, RequestExecutionHandler};
use sluse::reactor::Reactor;

struct OneShot {
    request: Mutex<Option<HttpRequest>>,
    done: Sender<()>,
}

impl RequestExecutionHandler for OneShot {
    fn initialize_context(&self, _ctx: &ExchangeContext, _attachment: Option<Box<dyn Any + Send>>) {}

    fn submit_request(&self, _ctx: &ExchangeContext) -> Option<HttpRequest> {
        self.request.lock().unwrap().take()
    }

    fn handle_response(&self, response: HttpResponse, _ctx: &ExchangeContext) {
        println!("{} {}", response.status(), response.head.reason);
        for header in response.head.headers.iter() {
            println!("{}: {}", header.name, header.value);
        }
        if let Some(mut body) = response.body {
            let mut text = Vec::new();
            let _ = body.read_to_end(&mut text);
            println!("\n{}", String::from_utf8_lossy(&text));
        }
        let _ = self.done.send(());
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "example.org".to_string());
    let addr: SocketAddr = (host.as_str(), 80)
        .to_socket_addrs()
        .expect("could not resolve host")
        .next()
        .expect("host has no address");

    let request = HttpRequest::new(Method::Get, "/")
        .header("Host", host.clone())
        .header("Connection", "close");

    let (done, completed) = bounded(1);
    let pool = Arc::new(WorkerPool::new(2));
    let handler = ClientHandler::builder()
        .execution_handler(OneShot {
            request: Mutex::new(Some(request)),
            done,
        })
        .executor(pool)
        .event_listener(LoggingEventListener)
        .build()
        .expect("invalid handler configuration");

    let mut reactor = Reactor::new(handler).expect("could not create reactor");
    let handle = reactor.handle();
    let driver = std::thread::spawn(move || reactor.run());

    handle.connect(addr, None).expect("reactor is not running");
    completed
        .recv_timeout(std::time::Duration::from_secs(30))
        .expect("no response");
    handle.stop().ok();
    let _ = driver.join();
}
