use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use crate::content::{Include, Routes, Static, Text};
use crate::filter::{Addition, Filters};
use crate::buf::Buf;
use crate::request::{Block, Node};
use crate::transport::mock::{Mock, Step};
use crate::{BudgetExceeded, ChildOptions, Config, Engine, Error, Request, ResponseHead, Session, StatusCode, Waker};

type Outcome = Poll<Result<StatusCode, Error>>;

fn engine(config: Config, routes: Routes) -> Arc<Engine> {
    Arc::new(Engine::new(config, routes))
}

fn start(engine: Arc<Engine>, mock: &Mock, uri: &str) -> Session {
    let mut session = Session::new(engine, mock.clone(), uri);
    session.run();
    session
}

fn head(req: &mut Request<'_>) -> Result<(), Error> {
    req.send_header(ResponseHead::new(StatusCode::OK).header("Content-Type", "text/plain"))
}

#[test]
fn child_output_between_parent_output() {
    let routes = Routes::new()
        .route_with("/", || {
            |req: &mut Request<'_>| -> Outcome {
                head(req)?;
                let _ = req.write("A");
                req.create_child("/x", ChildOptions::default())?;
                let _ = req.write("B");
                Poll::Ready(Ok(StatusCode::OK))
            }
        })
        .route("/x", Text::plain("X"));

    let mock = Mock::new();
    let session = start(engine(Config::default(), routes), &mock, "/");
    assert_eq!(mock.body(), "AXB");
    assert!(session.is_finished());
    assert!(!session.is_errored());
}

#[test]
fn sibling_children_in_creation_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (y, z) = (seen.clone(), seen.clone());

    let routes = Routes::new()
        .route_with("/", || {
            |req: &mut Request<'_>| -> Outcome {
                head(req)?;
                req.create_child("/y", ChildOptions::default())?;
                req.create_child("/z", ChildOptions::default())?;
                let _ = req.write("R");
                Poll::Ready(Ok(StatusCode::OK))
            }
        })
        .route_with("/y", move || {
            let seen = y.clone();
            move |req: &mut Request<'_>| -> Outcome {
                seen.lock().unwrap().push(("y", req.is_active()));
                let _ = req.write("YYY");
                Poll::Ready(Ok(StatusCode::OK))
            }
        })
        .route_with("/z", move || {
            let seen = z.clone();
            move |req: &mut Request<'_>| -> Outcome {
                seen.lock().unwrap().push(("z", req.is_active()));
                let _ = req.write("ZZZ");
                Poll::Ready(Ok(StatusCode::OK))
            }
        });

    let mock = Mock::new();
    let session = start(engine(Config::default(), routes), &mock, "/");
    assert_eq!(mock.body(), "YYYZZZR");
    assert!(session.is_finished());
    // the second sibling runs while the first owns the connection
    assert_eq!(*seen.lock().unwrap(), [("y", true), ("z", false)]);
}

#[test]
fn blocked_write_resumes_with_the_remainder() {
    let body = "x".repeat(100);
    let routes = Routes::new().route("/", Text::plain(body.clone()));
    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 100\r\n\r\n";

    let mock = Mock::new();
    mock.script([Step::Accept(head.len() + 50)]);
    let config = Config::default();
    let send_timeout = config.send_timeout;
    let mut session = start(engine(config, routes), &mock, "/");

    assert!(!session.is_finished());
    assert!(session.wants_write());
    assert_eq!(session.sent(), head.len() as u64 + 50);
    assert_eq!(mock.state().timer, Some(send_timeout));

    session.on_writable();
    assert!(session.is_finished());
    assert_eq!(mock.state().calls, [head.len() + 50, 50]);
    assert_eq!(mock.written_str(), format!("{head}{body}"));
    assert_eq!(mock.state().timer, None);
}

#[test]
fn subrequest_budget() {
    let rejected = Arc::new(AtomicBool::new(false));
    let flag = rejected.clone();

    let routes = Routes::new()
        .route_with("/", move || {
            let flag = flag.clone();
            move |req: &mut Request<'_>| -> Outcome {
                head(req)?;
                for _ in 0..200 {
                    req.create_child("/c", ChildOptions::default())?;
                }
                assert_eq!(req.remaining_subrequests(), 0);
                let err = req.create_child("/c", ChildOptions::default()).unwrap_err();
                flag.store(matches!(err, Error::Budget(BudgetExceeded::Subrequests)), Ordering::SeqCst);
                Poll::Ready(Ok(StatusCode::OK))
            }
        })
        .route("/c", Text::plain("c"));

    let mock = Mock::new();
    let session = start(engine(Config::default(), routes), &mock, "/");
    assert!(rejected.load(Ordering::SeqCst));
    assert_eq!(mock.body(), "c".repeat(200));
    assert!(session.is_finished());
}

#[derive(Clone)]
struct Upper {
    child: Option<crate::NodeId>,
    output: Arc<Mutex<Option<crate::ChildOutput>>>,
}

impl crate::content::Handler for Upper {
    fn handle(&mut self, req: &mut Request<'_>) -> Outcome {
        let Some(child) = self.child else {
            head(req)?;
            self.child = Some(req.create_child("/inner", ChildOptions { in_memory: true })?);
            return Poll::Pending;
        };
        let Some(output) = req.take_child_output(child) else {
            return Poll::Pending;
        };
        let _ = req.write(output.body.to_ascii_uppercase());
        *self.output.lock().unwrap() = Some(output);
        Poll::Ready(Ok(StatusCode::OK))
    }
}

#[test]
fn in_memory_child() {
    let output = Arc::new(Mutex::new(None));
    let routes = Routes::new()
        .route("/", Upper { child: None, output: output.clone() })
        .route("/inner", Text::plain("inner"));

    let mock = Mock::new();
    let session = start(engine(Config::default(), routes), &mock, "/");
    assert_eq!(mock.body(), "INNER");
    assert!(session.is_finished());
    assert_eq!(output.lock().unwrap().as_ref().map(|o| o.status), Some(StatusCode::OK));
}

#[test]
fn in_memory_capture_limit() {
    let output = Arc::new(Mutex::new(None));
    let routes = Routes::new()
        .route("/", Upper { child: None, output: output.clone() })
        .route("/inner", Text::plain("too long"));
    let config = Config { subrequest_output_buffer_size: 4, ..Config::default() };

    let mock = Mock::new();
    let session = start(engine(config, routes), &mock, "/");
    assert!(session.is_finished());
    let output = output.lock().unwrap().take().unwrap();
    assert_eq!(output.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(output.body.is_empty());
}

#[test]
fn finalize_once() {
    let routes = Routes::new().route_with("/", || |_: &mut Request<'_>| -> Outcome { Poll::Pending });

    let mock = Mock::new();
    let mut session = start(engine(Config::default(), routes), &mock, "/");
    let main = session.main_id();
    assert!(!session.is_finished());

    session.finalize(main, StatusCode::OK).unwrap();
    assert!(matches!(session.finalize(main, StatusCode::OK), Err(Error::Invariant(_))));

    session.run();
    assert!(session.is_finished());
    assert!(matches!(session.finalize(main, StatusCode::OK), Err(Error::Invariant(_))));
}

#[test]
fn waker_posts_the_request() {
    let slot = Arc::new(Mutex::new(None::<Waker>));
    let waker = slot.clone();

    let routes = Routes::new().route_with("/", move || {
        let slot = waker.clone();
        let mut parked = false;
        move |req: &mut Request<'_>| -> Outcome {
            if !parked {
                parked = true;
                head(req)?;
                *slot.lock().unwrap() = Some(req.waker());
                return Poll::Pending;
            }
            let _ = req.write("later");
            Poll::Ready(Ok(StatusCode::OK))
        }
    });

    let mock = Mock::new();
    let mut session = start(engine(Config::default(), routes), &mock, "/");
    assert!(!session.is_finished());

    // spurious runs keep the handler parked
    session.run();
    assert_eq!(mock.body(), "");

    let waker = slot.lock().unwrap().take().unwrap();
    std::thread::spawn(move || waker.wake()).join().unwrap();
    session.run();
    assert_eq!(mock.body(), "later");
    assert!(session.is_finished());
}

#[test]
fn block_delays_teardown() {
    let slot = Arc::new(Mutex::new(None::<Block>));
    let block = slot.clone();

    let routes = Routes::new().route_with("/", move || {
        let slot = block.clone();
        move |req: &mut Request<'_>| -> Outcome {
            *slot.lock().unwrap() = Some(req.block());
            Poll::Ready(Ok(StatusCode::NO_CONTENT))
        }
    });

    let mock = Mock::new();
    let mut session = start(engine(Config::default(), routes), &mock, "/");
    assert_eq!(session.len(), 1);

    slot.lock().unwrap().take();
    session.run();
    assert!(session.is_finished());
}

#[test]
fn redirect() {
    let routes = Routes::new()
        .route_with("/old", || {
            |req: &mut Request<'_>| -> Outcome {
                req.set_ctx(1u8);
                req.redirect("/new")?;
                Poll::Pending
            }
        })
        .route_with("/new", || {
            |req: &mut Request<'_>| -> Outcome {
                assert!(req.ctx::<u8>().is_none());
                assert_eq!(req.uri(), "/new");
                head(req)?;
                let _ = req.write("new");
                Poll::Ready(Ok(StatusCode::OK))
            }
        });

    let mock = Mock::new();
    let session = start(engine(Config::default(), routes), &mock, "/old");
    assert_eq!(mock.body(), "new");
    assert!(session.is_finished());
}

#[test]
fn redirect_cycle() {
    let routes = Routes::new().route_with("/loop", || {
        |req: &mut Request<'_>| -> Outcome {
            req.redirect("/loop")?;
            Poll::Pending
        }
    });

    let mock = Mock::new();
    let session = start(engine(Config::default(), routes), &mock, "/loop");
    assert!(session.is_finished());
    assert!(mock.written_str().starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(mock.body().contains("<h1>500 Internal Server Error</h1>"));
}

#[test]
fn released_node_frees_its_queue() {
    let routes = Routes::new().route("/", Text::plain("ok"));
    let mock = Mock::new();
    let mut session = start(engine(Config::default(), routes), &mock, "/");
    assert!(session.is_finished());
    assert!(!session.is_errored());

    // a finished node whose queue still holds output and a subrequest
    let mut child = Node::new("/child".into(), None, 0);
    child.done = true;
    child.own = None;
    child.queued = true;
    let child = session.nodes.insert(child);

    let chain = session.conn.pool.chain_from([Buf::from_bytes(&b"stale"[..])]).unwrap();
    let mut parent = Node::new("/parent".into(), None, 0);
    parent.done = true;
    parent.own = None;
    parent.postponed.push_data(&mut session.conn.pool, chain);
    parent.postponed.push_child(child);
    let parent = session.nodes.insert(parent);

    let links = session.conn.pool.free_link_count();
    session.run();

    assert!(!session.nodes.contains(parent));
    assert!(!session.nodes.contains(child), "dequeued subrequest is released too");
    assert_eq!(session.conn.pool.free_link_count(), links + 1);
    assert!(!session.is_errored());
    assert_eq!(mock.body(), "ok");
}

#[test]
fn not_found_page() {
    let mock = Mock::new();
    let session = start(engine(Config::default(), Routes::new()), &mock, "/missing?q=1");
    assert!(session.is_finished());
    assert!(mock.written_str().starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(mock.body().contains("<h1>404 Not Found</h1>"));
}

#[test]
fn addition() {
    let addition = Addition::new().before("/b").after("/a");
    let routes = Routes::new()
        .route("/", Text::html("M"))
        .route("/b", Text::plain("B"))
        .route("/a", Text::plain("A"));
    let engine = Engine::new(Config::default(), routes)
        .with_filters(Filters::default().header(addition.clone()).body(addition));

    let mock = Mock::new();
    let session = start(Arc::new(engine), &mock, "/");
    assert_eq!(mock.body(), "BMA");
    assert!(mock.written_str().contains("Connection: close\r\n"));
    assert!(session.is_finished());
}

#[test]
fn include_nested() {
    let routes = Routes::new()
        .route("/", Include::new(r#"<p><!--# include virtual="/a" -->|<!--# include virtual="/b" --></p>"#))
        .route("/a", Include::new(r#"a(<!--# include virtual="/b" -->)"#))
        .route("/b", Text::plain("b"));

    let mock = Mock::new();
    let session = start(engine(Config::default(), routes), &mock, "/");
    assert_eq!(mock.body(), "<p>a(b)|b</p>");
    assert!(session.is_finished());
}

#[test]
fn include_over_budget() {
    let routes = Routes::new()
        .route("/", Include::new(r#"1:<!--# include virtual="/x" --> 2:<!--# include virtual="/x" -->"#))
        .route("/x", Text::plain("X"));
    let config = Config { subrequests: 1, ..Config::default() };

    let mock = Mock::new();
    let session = start(engine(config, routes), &mock, "/");
    assert_eq!(mock.body(), "1:X 2:[an error occurred while processing the directive]");
    assert!(session.is_finished());
}

#[test]
fn static_file() {
    let dir = std::env::temp_dir().join(format!("weave-static-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("page.txt"), "file content").unwrap();

    let routes = Routes::new().prefix("/static/", Static::new(&dir).strip_prefix("/static"));
    let engine = engine(Config::default(), routes);

    let mock = Mock::new();
    let session = start(engine.clone(), &mock, "/static/page.txt");
    assert!(session.is_finished());
    assert!(mock.written_str().contains("Content-Length: 12\r\n"));
    assert_eq!(mock.body(), "file content");

    let mock = Mock::new();
    start(engine.clone(), &mock, "/static/none.txt");
    assert!(mock.written_str().starts_with("HTTP/1.1 404 Not Found\r\n"));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn transport_error_terminates() {
    let routes = Routes::new()
        .route_with("/", || {
            |req: &mut Request<'_>| -> Outcome {
                head(req)?;
                req.create_child("/x", ChildOptions::default())?;
                let _ = req.write("tail");
                Poll::Ready(Ok(StatusCode::OK))
            }
        })
        .route("/x", Text::plain("x"));
    let config = Config { postpone_output: 0, ..Config::default() };

    let mock = Mock::new();
    mock.script([Step::Fail]);
    let mut session = start(engine(config, routes), &mock, "/");
    assert!(session.is_errored());
    assert!(session.is_finished());
    assert!(mock.written().is_empty());

    session.close();
    assert!(session.pool().is_destroyed());
}

#[test]
fn send_timeout() {
    let mock = Mock::new();
    mock.script([Step::WouldBlock]);
    let routes = Routes::new().route("/", Text::plain("slow"));
    let mut session = start(engine(Config::default(), routes), &mock, "/");
    assert!(session.wants_write());
    assert!(mock.state().timer.is_some());

    session.on_timer();
    assert!(session.is_errored());
    assert!(session.is_finished());
}

#[test]
fn rate_limited_session() {
    let body = "r".repeat(300);
    let routes = Routes::new().route("/", Text::plain(body.clone()));
    let config = Config { limit_rate: 100, postpone_output: 0, ..Config::default() };

    let mock = Mock::new();
    let mut session = start(engine(config, routes), &mock, "/");
    assert!(!session.wants_write());

    let mut second = 0;
    while !session.is_finished() && second < 20 {
        assert!(mock.state().timer.is_some());
        second += 1;
        session.set_elapsed(Duration::from_secs(second));
        session.on_timer();
    }

    assert!(session.is_finished());
    assert_eq!(mock.body(), body);
    // 66 head bytes and 300 body bytes, at most 100 more each second
    assert_eq!(second, 3);
}
