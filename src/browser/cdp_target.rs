//! [`ClickTarget`] over a live chromiumoxide page, addressed by CSS selector.

use crate::features::click_engine::{
    BoundingBox, ClickTarget, ClickabilityReport, Point, ReadinessReport,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::Page;
use serde::Deserialize;

pub struct CdpClickTarget {
    page: Page,
    selector: String,
}

#[derive(Debug, Deserialize)]
struct ProbeRect {
    found: bool,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
}

#[derive(Debug, Deserialize)]
struct ProbeState {
    found: bool,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    busy: bool,
    #[serde(default)]
    in_viewport: bool,
    #[serde(default)]
    pointer_events: bool,
    #[serde(default)]
    occluded: bool,
    #[serde(default)]
    has_box: bool,
}

impl CdpClickTarget {
    /// Bind to `selector` on `page`; fails when nothing matches right now.
    pub async fn find(page: &Page, selector: &str) -> Result<Self> {
        let target = Self {
            page: page.clone(),
            selector: selector.to_string(),
        };
        let state = target.probe_state().await?;
        if !state.found {
            return Err(anyhow!("no element matches selector '{}'", selector));
        }
        Ok(target)
    }

    fn selector_literal(&self) -> Result<String> {
        serde_json::to_string(&self.selector).context("encode selector")
    }

    async fn eval_json<T: serde::de::DeserializeOwned>(&self, body: &str) -> Result<T> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); {} }})()",
            self.selector_literal()?,
            body
        );
        let raw = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| anyhow!("evaluate on '{}': {}", self.selector, e))?
            .into_value::<String>()
            .map_err(|e| anyhow!("evaluate on '{}' returned non-string: {}", self.selector, e))?;
        serde_json::from_str(&raw).context("decode probe result")
    }

    async fn probe_state(&self) -> Result<ProbeState> {
        self.eval_json(
            r#"
            if (!el) return JSON.stringify({ found: false });
            const r = el.getBoundingClientRect();
            const style = getComputedStyle(el);
            const cx = r.left + r.width / 2, cy = r.top + r.height / 2;
            const inView = r.bottom > 0 && r.right > 0
                && r.top < window.innerHeight && r.left < window.innerWidth;
            const hit = inView ? document.elementFromPoint(cx, cy) : null;
            return JSON.stringify({
                found: true,
                disabled: !!el.disabled || el.getAttribute('aria-disabled') === 'true',
                busy: el.getAttribute('aria-busy') === 'true',
                in_viewport: inView,
                pointer_events: style.pointerEvents !== 'none',
                occluded: !!hit && hit !== el && !el.contains(hit),
                has_box: r.width > 0 && r.height > 0,
            });
            "#,
        )
        .await
    }
}

#[async_trait]
impl ClickTarget for CdpClickTarget {
    fn describe(&self) -> String {
        self.selector.clone()
    }

    async fn inspect_readiness(&self) -> Result<ReadinessReport> {
        let state = self.probe_state().await?;
        if !state.found {
            return Err(anyhow!("element '{}' detached", self.selector));
        }
        Ok(ReadinessReport {
            disabled: state.disabled,
            busy: state.busy,
        })
    }

    async fn assess_clickability(&self) -> Result<ClickabilityReport> {
        let state = self.probe_state().await?;
        if !state.found {
            return Err(anyhow!("element '{}' detached", self.selector));
        }
        Ok(ClickabilityReport {
            has_bounding_box: state.has_box,
            in_viewport: state.in_viewport,
            pointer_events_enabled: state.pointer_events,
            center_occluded: state.occluded,
        })
    }

    async fn scroll_into_view(&self) -> Result<()> {
        let element = self
            .page
            .find_element(self.selector.as_str())
            .await
            .map_err(|e| anyhow!("find '{}': {}", self.selector, e))?;
        element
            .scroll_into_view()
            .await
            .map_err(|e| anyhow!("scroll '{}': {}", self.selector, e))?;
        Ok(())
    }

    async fn click(&self) -> Result<()> {
        let element = self
            .page
            .find_element(self.selector.as_str())
            .await
            .map_err(|e| anyhow!("find '{}': {}", self.selector, e))?;
        element
            .click()
            .await
            .map_err(|e| anyhow!("click '{}': {}", self.selector, e))?;
        Ok(())
    }

    async fn bounding_box(&self) -> Result<Option<BoundingBox>> {
        let rect: ProbeRect = self
            .eval_json(
                r#"
                if (!el) return JSON.stringify({ found: false });
                const r = el.getBoundingClientRect();
                return JSON.stringify({ found: true, x: r.left, y: r.top, width: r.width, height: r.height });
                "#,
            )
            .await?;
        if !rect.found {
            return Ok(None);
        }
        let bbox = BoundingBox {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        };
        Ok((!bbox.is_empty()).then_some(bbox))
    }

    async fn move_pointer(&self, to: Point) -> Result<()> {
        self.page
            .move_mouse(chromiumoxide::layout::Point::new(to.x, to.y))
            .await
            .map_err(|e| anyhow!("move pointer to ({:.1}, {:.1}): {}", to.x, to.y, e))?;
        Ok(())
    }

    async fn click_at(&self, point: Point) -> Result<()> {
        self.page
            .click(chromiumoxide::layout::Point::new(point.x, point.y))
            .await
            .map_err(|e| anyhow!("click at ({:.1}, {:.1}): {}", point.x, point.y, e))?;
        Ok(())
    }

    async fn dispatch_click(&self) -> Result<bool> {
        #[derive(Deserialize)]
        struct Dispatched {
            found: bool,
            #[serde(default)]
            accepted: bool,
        }
        let result: Dispatched = self
            .eval_json(
                r#"
                if (!el) return JSON.stringify({ found: false });
                const opts = { bubbles: true, cancelable: true, view: window };
                el.dispatchEvent(new MouseEvent('mousedown', opts));
                el.dispatchEvent(new MouseEvent('mouseup', opts));
                const accepted = el.dispatchEvent(new MouseEvent('click', opts));
                return JSON.stringify({ found: true, accepted });
                "#,
            )
            .await?;
        if !result.found {
            return Err(anyhow!("element '{}' detached before dispatch", self.selector));
        }
        Ok(result.accepted)
    }
}
