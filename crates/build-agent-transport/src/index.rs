//! Browser terminal served at `/`.

use axum::response::Html;

pub async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Attaches a text terminal to the context named in the URL fragment
/// (`/#/build-42`), or to the default context.
pub const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Build Agent</title>
    <link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/xterm@5.3.0/css/xterm.css" />
    <script src="https://cdn.jsdelivr.net/npm/xterm@5.3.0/lib/xterm.js"></script>
    <script src="https://cdn.jsdelivr.net/npm/xterm-addon-fit@0.8.0/lib/xterm-addon-fit.js"></script>
    <style>
        body { margin: 0; padding: 20px; background: #1e1e1e; font-family: system-ui, sans-serif; }
        h1 { color: #fff; margin-bottom: 10px; }
        #terminal-container { width: 100%; height: calc(100vh - 120px); }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        #command { width: 100%; margin-bottom: 10px; font-family: monospace; }
    </style>
</head>
<body>
    <h1>Build Agent</h1>
    <div class="status" id="status">Connecting...</div>
    <input id="command" placeholder="Command to run" />
    <div id="terminal-container"></div>

    <script>
        const term = new Terminal({ cursorBlink: true, fontSize: 14 });
        const fitAddon = new FitAddon.FitAddon();
        term.loadAddon(fitAddon);
        term.open(document.getElementById('terminal-container'));
        fitAddon.fit();

        const status = document.getElementById('status');
        const context = window.location.hash.slice(1);
        let lastSeq = -1;
        let ws;

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            const replay = lastSeq >= 0 ? `?replayFrom=${lastSeq}` : '';
            ws = new WebSocket(`${protocol}//${window.location.host}/socket/text${context}${replay}`);

            ws.onopen = () => {
                status.textContent = `Connected to ${context || 'default context'}`;
                status.className = 'status connected';
                const { cols, rows } = term;
                ws.send(JSON.stringify({ type: 'resize', cols, rows }));
            };

            ws.onclose = () => {
                status.textContent = 'Disconnected - reconnecting...';
                status.className = 'status disconnected';
                setTimeout(connect, 2000);
            };

            ws.onmessage = (event) => {
                const msg = JSON.parse(event.data);
                if (msg.type === 'output') {
                    lastSeq = msg.seq;
                    term.write(msg.data);
                } else if (msg.type === 'task_started') {
                    term.writeln(`\r\n[Task ${msg.task_id} started]`);
                } else if (msg.type === 'preempted') {
                    term.writeln('\r\n[Control taken by another observer]');
                } else if (msg.type === 'error') {
                    term.writeln(`\r\n[Error: ${msg.message}]`);
                }
            };
        }

        term.onData((data) => {
            if (ws && ws.readyState === WebSocket.OPEN) {
                ws.send(JSON.stringify({ type: 'input', data: btoa(data) }));
            }
        });

        document.getElementById('command').addEventListener('keydown', (event) => {
            if (event.key !== 'Enter' || !ws || ws.readyState !== WebSocket.OPEN) return;
            ws.send(JSON.stringify({ type: 'execute', command: event.target.value }));
            event.target.value = '';
        });

        window.addEventListener('resize', () => {
            fitAddon.fit();
            if (ws && ws.readyState === WebSocket.OPEN) {
                const { cols, rows } = term;
                ws.send(JSON.stringify({ type: 'resize', cols, rows }));
            }
        });

        connect();
    </script>
</body>
</html>
"#;
