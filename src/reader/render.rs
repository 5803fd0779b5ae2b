//! HTML rendering for the reader page and viewer placeholders.

use std::fmt::Write as _;

use super::engine::EngineStatus;
use super::models::UserIdentity;
use super::navigation::NavigationSnapshot;
use super::runner::CodeRunState;

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub fn welcome_placeholder() -> String {
    "<div class=\"welcome\"><h1>Welcome to Pagewise</h1>\
     <p>Select a chapter from the library on the left to start reading.</p></div>"
        .to_string()
}

pub fn loading_placeholder() -> String {
    "<div class=\"loading\" aria-busy=\"true\"><p>Loading chapter…</p></div>".to_string()
}

pub fn no_content_placeholder(title: &str) -> String {
    format!(
        "<h1>{}</h1><p>This chapter doesn't have content yet. \
         Admin can add content using the \"Add Content\" button.</p>",
        escape_html(title)
    )
}

pub fn load_failed_placeholder() -> String {
    "<h1>Error Loading Chapter</h1>\
     <p class=\"error\">Failed to load chapter content. Please try again.</p>"
        .to_string()
}

/// Everything the reader page shows for one session.
pub struct PageView<'a> {
    pub session_id: &'a str,
    pub navigation: &'a NavigationSnapshot,
    pub outline_html: &'a str,
    pub content_html: &'a str,
    pub run: &'a CodeRunState,
    pub engine: &'a EngineStatus,
    pub user: Option<&'a UserIdentity>,
    pub is_admin: bool,
}

const PAGE_SCRIPT: &str = r#"
async function act(body) {
  const sid = document.body.dataset.session;
  await fetch(`/api/sessions/${sid}/actions`, {
    method: 'POST',
    headers: {'content-type': 'application/json'},
    body: JSON.stringify(body),
  });
  location.reload();
}
document.addEventListener('click', (e) => {
  const node = e.target.closest('[data-node]');
  if (node) {
    e.stopPropagation();
    const [kind, id] = node.dataset.node.split('-');
    act({action: 'click_node', node: {kind, id: Number(id)}});
    return;
  }
  const button = e.target.closest('[data-action]');
  if (!button) return;
  const body = {action: button.dataset.action};
  if (body.action === 'run') body.source = document.getElementById('source').value;
  act(body);
});
const feed = new WebSocket(
  `${location.protocol === 'https:' ? 'wss' : 'ws'}://${location.host}/ws?session=${document.body.dataset.session}`);
feed.addEventListener('message', (e) => {
  const {type} = JSON.parse(e.data);
  if (type === 'SandboxFinished' || type.startsWith('Book') || type.startsWith('Chapter')) {
    location.reload();
  }
});
"#;

pub fn render_page(view: &PageView<'_>) -> String {
    let nav = view.navigation;
    let mut html = String::new();
    let body_class = nav.theme.root_class().unwrap_or("");

    let _ = write!(
        html,
        "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>Pagewise</title></head>\
         <body class=\"{}\" data-session=\"{}\">",
        body_class,
        escape_html(view.session_id)
    );

    render_navbar(&mut html, view);

    html.push_str("<main class=\"layout\">");
    if nav.left_panel_visible {
        let _ = write!(
            html,
            "<aside class=\"left-panel\"><h2>Library</h2>{}</aside>",
            view.outline_html
        );
    }
    let _ = write!(
        html,
        "<section class=\"center-panel {}\"><article class=\"prose\">{}</article></section>",
        nav.content_width().css_class(),
        view.content_html
    );
    if nav.right_panel_visible {
        render_sandbox(&mut html, view.run, view.engine, view.user.is_some());
    }
    html.push_str("</main>");

    if view.is_admin && nav.authoring_modal_open {
        html.push_str(
            "<div class=\"modal\" role=\"dialog\"><h2>Add Content</h2>\
             <p>Use <code>pagewise author</code> or the REST API to manage books and chapters.</p>\
             <button data-action=\"toggle_authoring\">Close</button></div>",
        );
    }

    let _ = write!(html, "<script>{}</script></body></html>", PAGE_SCRIPT);
    html
}

fn render_navbar(html: &mut String, view: &PageView<'_>) {
    let theme_label = match view.navigation.theme.toggled() {
        super::navigation::Theme::Dark => "Dark mode",
        super::navigation::Theme::Light => "Light mode",
    };
    let _ = write!(
        html,
        "<nav class=\"navbar\"><span class=\"brand\">Pagewise</span>\
         <button data-action=\"toggle_left_panel\">Library</button>\
         <button data-action=\"toggle_right_panel\">Sandbox</button>\
         <button data-action=\"toggle_theme\" aria-label=\"Toggle Theme\">{}</button>",
        theme_label
    );
    if view.is_admin {
        html.push_str("<button data-action=\"toggle_authoring\">Add Content</button>");
    }
    match view.user {
        Some(user) => {
            let _ = write!(
                html,
                "<span class=\"user\">{}</span>",
                escape_html(&user.display_name())
            );
        }
        None => html.push_str("<span class=\"user anonymous\">Not signed in</span>"),
    }
    html.push_str("</nav>");
}

fn render_sandbox(html: &mut String, run: &CodeRunState, engine: &EngineStatus, signed_in: bool) {
    let disabled = if run.busy || !engine.is_ready() || !signed_in {
        " disabled"
    } else {
        ""
    };
    let _ = write!(
        html,
        "<aside class=\"right-panel\"><h2>Sandbox</h2>\
         <button data-action=\"clear_output\">Clear Output</button>\
         <button data-action=\"run\"{}>Run</button>\
         <textarea id=\"source\" spellcheck=\"false\">{}</textarea>",
        disabled,
        escape_html(&run.source_text)
    );
    match engine {
        EngineStatus::Uninitialized | EngineStatus::Loading => {
            html.push_str("<p class=\"engine-status\">Loading Python…</p>")
        }
        EngineStatus::Failed(reason) => {
            let _ = write!(
                html,
                "<p class=\"engine-status error\">Sandbox unavailable: {}</p>",
                escape_html(reason)
            );
        }
        EngineStatus::Disabled => {
            html.push_str("<p class=\"engine-status\">Sandbox disabled</p>")
        }
        EngineStatus::Ready if !signed_in => {
            html.push_str("<p class=\"engine-status\">Sign in to run code.</p>")
        }
        EngineStatus::Ready => {}
    }
    html.push_str("<div class=\"console\"><div class=\"console-title\">Console Output</div>");
    if run.output_lines.is_empty() {
        html.push_str("<span class=\"console-empty\">Ready...</span>");
    } else {
        for line in &run.output_lines {
            let _ = write!(html, "<div class=\"console-line\">{}</div>", escape_html(line));
        }
    }
    html.push_str("</div></aside>");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::navigation::Theme;

    fn view<'a>(
        nav: &'a NavigationSnapshot,
        run: &'a CodeRunState,
        engine: &'a EngineStatus,
    ) -> PageView<'a> {
        PageView {
            session_id: "s-1",
            navigation: nav,
            outline_html: "<ul class=\"outline\"></ul>",
            content_html: "<p>body</p>",
            run,
            engine,
            user: None,
            is_admin: false,
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_placeholders() {
        assert!(welcome_placeholder().contains("Select a chapter from the library"));
        let html = no_content_placeholder("Intro & Setup");
        assert!(html.contains("<h1>Intro &amp; Setup</h1>"));
        assert!(html.contains("Admin can add content"));
        assert!(load_failed_placeholder().contains("Please try again."));
    }

    #[test]
    fn test_dark_theme_sets_body_class() {
        let mut nav = NavigationSnapshot::default();
        let run = CodeRunState::default();
        let html = render_page(&view(&nav, &run, &EngineStatus::Ready));
        assert!(html.contains("<body class=\"\""));

        nav.theme = Theme::Dark;
        let html = render_page(&view(&nav, &run, &EngineStatus::Ready));
        assert!(html.contains("<body class=\"dark\""));
    }

    #[test]
    fn test_hidden_panels_are_not_rendered() {
        let nav = NavigationSnapshot {
            left_panel_visible: false,
            right_panel_visible: false,
            ..Default::default()
        };
        let run = CodeRunState::default();
        let html = render_page(&view(&nav, &run, &EngineStatus::Ready));
        assert!(!html.contains("left-panel"));
        assert!(!html.contains("right-panel"));
        assert!(html.contains("center-panel max-w-5xl"));
    }

    #[test]
    fn test_authoring_modal_requires_admin() {
        let nav = NavigationSnapshot {
            authoring_modal_open: true,
            ..Default::default()
        };
        let run = CodeRunState::default();
        let engine = EngineStatus::Ready;

        let html = render_page(&view(&nav, &run, &engine));
        assert!(!html.contains("role=\"dialog\""));
        assert!(!html.contains("Add Content</button>"));

        let admin = PageView {
            is_admin: true,
            ..view(&nav, &run, &engine)
        };
        assert!(render_page(&admin).contains("role=\"dialog\""));
    }

    #[test]
    fn test_sandbox_output_and_run_button() {
        let nav = NavigationSnapshot::default();
        let mut run = CodeRunState::default();
        let html = render_page(&view(&nav, &run, &EngineStatus::Loading));
        assert!(html.contains("Ready..."));
        assert!(html.contains("data-action=\"run\" disabled"));

        run.output_lines = vec!["1 < 2".into()];
        let html = render_page(&view(&nav, &run, &EngineStatus::Ready));
        assert!(html.contains("<div class=\"console-line\">1 &lt; 2</div>"));
        assert!(html.contains("data-action=\"run\" disabled"));
        assert!(html.contains("Sign in to run code."));

        let reader = UserIdentity::new("reader");
        let signed_in = PageView {
            user: Some(&reader),
            ..view(&nav, &run, &EngineStatus::Ready)
        };
        let html = render_page(&signed_in);
        assert!(html.contains("data-action=\"run\">"));
        assert!(!html.contains("Sign in to run code."));
    }
}
