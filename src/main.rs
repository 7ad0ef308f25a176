//! Screening dashboard: pick resumes, run an analysis, and watch the cache
//! and the cross-tab lock at work.

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use gloo_timers::callback::Timeout;
use screener_cache::{
    web, AnalysisEvent, AnalysisOrchestrator, AnalysisRequest, CacheConfig, CandidateAnalyzer,
    FileDescriptor, LockConfig,
};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::BTreeSet;
use web_sys::{HtmlInputElement, HtmlTextAreaElement};
use yew::prelude::*;

mod components;
mod hooks;

use components::{render_run_log, CacheStatsPanel, LockBadge};
use hooks::{use_cache_stats, use_lock_status};

/// Delay standing in for a model round trip.
const PREVIEW_DELAY_MS: u32 = 400;

async fn pause(ms: u32) {
    let (done, wait) = futures::channel::oneshot::channel();
    let _timer = Timeout::new(ms, move || {
        let _ = done.send(());
    });
    let _ = wait.await;
}

fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Offline analyzer: scores each file by keyword overlap between its name
/// and the job description, and reports which filters would be enforced.
struct PreviewAnalyzer;

impl CandidateAnalyzer<Value> for PreviewAnalyzer {
    type Error = String;

    fn analyze<'a>(
        &'a self,
        request: &'a AnalysisRequest,
        files: &'a [FileDescriptor],
    ) -> LocalBoxFuture<'a, Result<Vec<Result<Value, String>>, String>> {
        async move {
            pause(PREVIEW_DELAY_MS).await;
            log::debug!("Preview scoring against:\n{}", request.weights.compact_summary());
            let wanted = keywords(&request.jd_text);
            let mandatory = request.filters.mandatory_filters();
            Ok(files
                .iter()
                .map(|file| {
                    let found = keywords(&file.name);
                    let hits = wanted.intersection(&found).count();
                    let score = if wanted.is_empty() { 0 } else { hits * 100 / wanted.len() };
                    Ok(json!({ "fileName": file.name, "score": score, "mandatory": mandatory }))
                })
                .collect())
        }
        .boxed_local()
    }
}

fn describe_event(event: &AnalysisEvent<Value>) -> String {
    match event {
        AnalysisEvent::Progress(message) => message.clone(),
        AnalysisEvent::Cached { file, result } => {
            format!("{} (cached): {}", file.name, result["score"])
        }
        AnalysisEvent::Analyzed { file, result } => format!("{}: {}", file.name, result["score"]),
        AnalysisEvent::Failed { file, error } => format!("{} failed: {}", file.name, error),
    }
}

fn selected_files(input: &HtmlInputElement) -> Vec<FileDescriptor> {
    let Some(list) = input.files() else {
        return Vec::new();
    };
    (0..list.length())
        .filter_map(|i| list.get(i))
        .map(|file| {
            FileDescriptor::new(file.name(), file.size() as u64, file.last_modified() as i64)
        })
        .collect()
}

#[function_component]
pub fn App() -> Html {
    let service = use_memo((), |_| {
        web::connect::<Value>(CacheConfig::default(), LockConfig::default())
    });
    let stats = use_cache_stats(service.clone());
    let status = use_lock_status(service.lock().clone());
    let jd_text = use_state(String::new);
    let files = use_state(Vec::<FileDescriptor>::new);
    let run_log = use_state(Vec::<String>::new);

    {
        let service = service.clone();
        use_effect_with((), move |_| {
            let unload = web::release_on_unload(service.lock());
            move || drop(unload)
        });
    }

    let on_jd_input = {
        let jd_text = jd_text.clone();
        Callback::from(move |e: InputEvent| {
            let area: HtmlTextAreaElement = e.target_unchecked_into();
            jd_text.set(area.value());
        })
    };

    let on_files = {
        let files = files.clone();
        Callback::from(move |e: Event| {
            let input: HtmlInputElement = e.target_unchecked_into();
            files.set(selected_files(&input));
        })
    };

    let on_analyse = {
        let service = service.clone();
        let jd_text = jd_text.clone();
        let files = files.clone();
        let run_log = run_log.clone();
        let refresh = stats.refresh.clone();
        Callback::from(move |_: MouseEvent| {
            let service = service.clone();
            let request =
                AnalysisRequest { jd_text: (*jd_text).clone(), ..AnalysisRequest::default() };
            let files = (*files).clone();
            let run_log = run_log.clone();
            let refresh = refresh.clone();
            wasm_bindgen_futures::spawn_local(async move {
                let lines = RefCell::new(Vec::new());
                let orchestrator = AnalysisOrchestrator::new(&*service, PreviewAnalyzer);
                let outcome = orchestrator
                    .run(&request, &files, |event| {
                        lines.borrow_mut().push(describe_event(&event));
                        run_log.set(lines.borrow().clone());
                    })
                    .await;
                if let Err(e) = outcome {
                    lines.borrow_mut().push(e.to_string());
                    run_log.set(lines.into_inner());
                }
                refresh.emit(());
            });
        })
    };

    let on_clear = {
        let service = service.clone();
        let refresh = stats.refresh.clone();
        Callback::from(move |_| {
            let confirmed = web_sys::window()
                .and_then(|w| w.confirm_with_message("Clear every cached analysis?").ok())
                .unwrap_or(false);
            if confirmed {
                service.clear_cache();
                refresh.emit(());
            }
        })
    };

    html! {
        <div class="container">
            <header>
                <h1>{ "Resume Screening" }</h1>
                <LockBadge status={status} />
            </header>
            <div class="form-group">
                <label for="jd">{ "Job description:" }</label>
                <textarea id="jd" value={(*jd_text).clone()} oninput={on_jd_input} />
            </div>
            <div class="form-group">
                <label for="resumes">{ "Resumes:" }</label>
                <input id="resumes" type="file" multiple={true} onchange={on_files} />
            </div>
            <button onclick={on_analyse} disabled={status.is_busy() || files.is_empty()}>
                { format!("Analyse {} files", files.len()) }
            </button>
            { render_run_log(&run_log) }
            <CacheStatsPanel
                stats={stats.stats.clone()}
                capacity={service.store().capacity()}
                on_refresh={stats.refresh.clone()}
                on_clear={on_clear}
            />
        </div>
    }
}

/// Entry point: installs the panic hook and console logger, then renders.
fn main() {
    console_error_panic_hook::set_once();
    web::init_logging(log::LevelFilter::Info);
    yew::Renderer::<App>::new().render();
}
