//! HTML for the read-only admin overview.

use feedback_infra::html;
use feedback_infra::jobs::{JobCounts, JobState, QueueName, WorkerStats};

fn layout(title: &str, content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title} - Feedback Queues</title>
    <style>
        * {{ box-sizing: border-box; margin: 0; padding: 0; }}
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background: #f5f5f5; color: #333; line-height: 1.6; }}
        .container {{ max-width: 1200px; margin: 0 auto; padding: 20px; }}
        header {{ background: #2563eb; color: white; padding: 20px; margin-bottom: 20px; }}
        header h1 {{ font-size: 1.5rem; }}
        h2 {{ font-size: 1.1rem; margin: 20px 0 10px; }}
        .stats {{ display: grid; grid-template-columns: repeat(auto-fit, minmax(150px, 1fr)); gap: 20px; margin-bottom: 10px; }}
        .stat-card {{ background: white; padding: 20px; border-radius: 8px; box-shadow: 0 1px 3px rgba(0,0,0,0.1); text-align: center; }}
        .stat-card h3 {{ font-size: 2rem; color: #2563eb; }}
        .stat-card p {{ text-transform: uppercase; font-size: 0.8rem; }}
        .stat-card a {{ color: inherit; text-decoration: none; }}
        .badge {{ display: inline-block; padding: 4px 12px; border-radius: 20px; font-size: 0.75rem; font-weight: 600; }}
        .badge-waiting {{ background: #dbeafe; color: #1d4ed8; }}
        .badge-active {{ background: #fef3c7; color: #d97706; }}
        .badge-completed {{ background: #d1fae5; color: #059669; }}
        .badge-failed {{ background: #fee2e2; color: #dc2626; }}
        table {{ width: 100%; border-collapse: collapse; background: white; border-radius: 8px; }}
        th, td {{ padding: 12px 20px; text-align: left; border-bottom: 1px solid #e5e7eb; }}
        th {{ background: #f8fafc; font-weight: 600; color: #666; font-size: 0.85rem; text-transform: uppercase; }}
        .empty-state {{ text-align: center; padding: 40px; color: #666; }}
    </style>
</head>
<body>
    <header><div class="container"><h1>Feedback Queues</h1></div></header>
    <div class="container">
        {content}
    </div>
</body>
</html>"#
    )
}

fn state_badge(state: JobState) -> &'static str {
    match state {
        JobState::Waiting => "badge-waiting",
        JobState::Active => "badge-active",
        JobState::Completed => "badge-completed",
        JobState::Failed => "badge-failed",
    }
}

fn queue_section(queue: QueueName, counts: &JobCounts) -> String {
    let cards = JobState::ALL
        .iter()
        .map(|state| {
            format!(
                r#"<div class="stat-card"><a href="/admin/queues/{queue}/jobs?state={state}"><h3>{count}</h3><p><span class="badge {badge}">{state}</span></p></a></div>"#,
                count = counts.get(*state),
                badge = state_badge(*state),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(r#"<h2>{queue}</h2><div class="stats">{cards}</div>"#)
}

fn workers_table(workers: &[WorkerStats]) -> String {
    let rows = if workers.is_empty() {
        r#"<tr><td colspan="6" class="empty-state">No workers running in this process</td></tr>"#
            .to_string()
    } else {
        workers
            .iter()
            .map(|w| {
                format!(
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                    html::escape(&w.worker),
                    w.queue,
                    w.current_running,
                    w.jobs_succeeded,
                    w.jobs_retried,
                    w.jobs_failed,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        r#"<h2>Workers</h2><table><thead><tr><th>Worker</th><th>Queue</th><th>Running</th><th>Succeeded</th><th>Retried</th><th>Failed</th></tr></thead><tbody>{rows}</tbody></table>"#
    )
}

pub fn render_overview(queues: &[(QueueName, JobCounts)], workers: &[WorkerStats]) -> String {
    let mut content: String = queues
        .iter()
        .map(|(queue, counts)| queue_section(*queue, counts))
        .collect();
    content.push_str(&workers_table(workers));
    layout("Overview", &content)
}
