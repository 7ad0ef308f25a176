//! Pure Yew view components for the screening dashboard.

use screener_cache::{CacheStatistics, LockStatus};
use yew::prelude::*;

/// Colour band for the entry count: green while small, red near capacity.
pub fn size_class(size: usize) -> &'static str {
    match size {
        0..=19 => "size-low",
        20..=49 => "size-mid",
        _ => "size-high",
    }
}

pub fn hit_rate_label(hit_rate: f64) -> String {
    format!("{:.1}%", hit_rate * 100.0)
}

pub fn status_label(status: LockStatus) -> &'static str {
    match status {
        LockStatus::Idle => "Ready",
        LockStatus::BusyHere => "Analysing in this tab",
        LockStatus::BusyElsewhere => "Another tab is analysing",
    }
}

fn format_timestamp(ms: i64) -> String {
    let date = js_sys::Date::new(&wasm_bindgen::JsValue::from_f64(ms as f64));
    String::from(date.to_locale_string("default", &wasm_bindgen::JsValue::UNDEFINED))
}

/// Shows cache statistics with refresh and clear actions.
#[derive(Properties, PartialEq)]
pub struct CacheStatsProps {
    pub stats: CacheStatistics,
    pub capacity: usize,
    pub on_refresh: Callback<()>,
    pub on_clear: Callback<()>,
}

#[function_component(CacheStatsPanel)]
pub fn cache_stats_panel(props: &CacheStatsProps) -> Html {
    let stats = &props.stats;
    let on_refresh = props.on_refresh.reform(|_: MouseEvent| ());
    let on_clear = props.on_clear.reform(|_: MouseEvent| ());

    html! {
        <div class="cache-stats">
            <h3>{ "Cache Statistics" }</h3>
            <div class="cache-row">
                <span>{ "Entries:" }</span>
                <span class={classes!("mono", size_class(stats.size))}>
                    { format!("{}/{}", stats.size, props.capacity) }
                </span>
            </div>
            <div class="cache-row">
                <span>{ "Hit Rate:" }</span>
                <span class="mono">{ hit_rate_label(stats.hit_rate) }</span>
            </div>
            { stats.oldest_entry.map(|ms| html! {
                <div class="cache-row">
                    <span>{ "Oldest:" }</span>
                    <span class="mono">{ format_timestamp(ms) }</span>
                </div>
            }).unwrap_or_default() }
            { stats.newest_entry.map(|ms| html! {
                <div class="cache-row">
                    <span>{ "Newest:" }</span>
                    <span class="mono">{ format_timestamp(ms) }</span>
                </div>
            }).unwrap_or_default() }
            <div class="cache-actions">
                <button onclick={on_refresh}>{ "Refresh" }</button>
                <button onclick={on_clear} disabled={stats.size == 0}>{ "Clear" }</button>
            </div>
        </div>
    }
}

#[derive(Properties, PartialEq)]
pub struct LockBadgeProps {
    pub status: LockStatus,
}

#[function_component(LockBadge)]
pub fn lock_badge(props: &LockBadgeProps) -> Html {
    let class = if props.status.is_busy() { "lock-badge busy" } else { "lock-badge idle" };
    html! {
        <span class={class}>{ status_label(props.status) }</span>
    }
}

/// Progress and per-file outcomes of the latest run, oldest first.
pub fn render_run_log(lines: &[String]) -> Html {
    if lines.is_empty() {
        return html! {};
    }
    html! {
        <ul class="run-log">
            { lines.iter().map(|line| html! { <li>{ line }</li> }).collect::<Html>() }
        </ul>
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_bands() {
        assert_eq!(size_class(0), "size-low");
        assert_eq!(size_class(20), "size-mid");
        assert_eq!(size_class(100), "size-high");
    }

    #[test]
    fn hit_rate_is_a_percentage() {
        assert_eq!(hit_rate_label(0.0), "0.0%");
        assert_eq!(hit_rate_label(2.0 / 3.0), "66.7%");
    }
}
