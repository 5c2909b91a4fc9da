//! Pages shown to the admin at the end of the authorization flow.

const SUCCESS_PAGE: &str = r#"<!doctype html>
<html lang="zh-CN">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>微信授权成功</title>
  <style>
    body{font-family:-apple-system,BlinkMacSystemFont,Segoe UI,Roboto,Helvetica,Arial,sans-serif;margin:0;padding:24px;background:#f7f8fa;}
    .card{max-width:520px;margin:48px auto;background:#fff;border-radius:12px;padding:24px;box-shadow:0 4px 14px rgba(0,0,0,.06);}
    h1{font-size:18px;margin:0 0 12px;}
    p{margin:0;color:#666;line-height:1.6;}
    .ok{color:#1a7f37;font-weight:600;}
  </style>
</head>
<body>
  <div class="card">
    <h1 class="ok">授权成功</h1>
    <p>你可以关闭本页面，返回管理后台继续操作。</p>
  </div>
  <script>
    try { window.opener && window.opener.postMessage('wechat_auth_success', '*'); } catch (e) {}
    try { window.parent && window.parent.postMessage('wechat_auth_success', '*'); } catch (e) {}
    setTimeout(function(){ try{ window.close(); } catch(e){} }, 200);
  </script>
</body>
</html>"#;

/// Page confirming the authorization. Notifies the opener window.
pub fn success_page() -> String {
    SUCCESS_PAGE.to_string()
}

/// Page reporting a failed authorization with the escaped reason.
pub fn failure_page(reason: &str) -> String {
    let reason = if reason.trim().is_empty() {
        "授权失败"
    } else {
        reason
    };
    format!(
        r#"<!doctype html>
<html lang="zh-CN">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>微信授权失败</title>
</head>
<body>
  <p>授权失败：{}</p>
</body>
</html>"#,
        escape_html(reason)
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
