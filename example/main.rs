use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use std::time::Duration;

use tokio::{net::TcpListener, runtime::Runtime};
use weave::{
    Config, Engine, Error, Request, ResponseHead, StatusCode,
    content::{Handler, Include, Routes, Static, Text},
    filter::{Addition, Filters},
};

const INDEX: &str = r#"<main>
<p>fast: <!--# include virtual="/fast" --></p>
<p>slow: <!--# include virtual="/slow" --></p>
<p>fast again: <!--# include virtual="/fast" --></p>
</main>
"#;

fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Config::from_env().map_err(io::Error::other)?;
    let routes = Routes::new()
        .route("/", Include::new(INDEX))
        .route("/header", Text::html("<header>weave</header>\n"))
        .route("/footer", Text::html("<footer>in document order</footer>\n"))
        .route("/fast", Text::html("ready"))
        .route_with("/slow", slow)
        .prefix("/static/", Static::new("static").strip_prefix("/static"));

    let addition = Addition::new().before("/header").after("/footer");
    let filters = Filters::default().header(addition.clone()).body(addition);
    let engine = Arc::new(Engine::new(config, routes).with_filters(filters));

    Runtime::new()?.block_on(async {
        let io = TcpListener::bind("0.0.0.0:3000").await?;
        weave::rt::serve(io, engine).await;
        Ok(())
    })
}

/// Answers after a timer, the following includes wait for it.
fn slow() -> impl Handler {
    let mut done: Option<Arc<AtomicBool>> = None;

    move |req: &mut Request<'_>| -> Poll<Result<StatusCode, Error>> {
        let Some(flag) = &done else {
            let flag = Arc::new(AtomicBool::new(false));
            let waker = req.waker();
            let fired = Arc::clone(&flag);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                fired.store(true, Ordering::Release);
                waker.wake();
            });
            done = Some(flag);
            return Poll::Pending;
        };
        if !flag.load(Ordering::Acquire) {
            return Poll::Pending;
        }

        req.send_header(ResponseHead::new(StatusCode::OK).header("Content-Type", "text/html"))?;
        if let Poll::Ready(Err(err)) = req.write("finally") {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(StatusCode::OK))
    }
}
