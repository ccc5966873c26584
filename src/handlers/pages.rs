pub const HOME_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Google Calendar Integration</title></head>
<body>
    <h2>Google Calendar Integration</h2>
    <a href="/authorize">Connect Google Calendar</a><br><br>
    <a href="/test">Test Booking Form</a>
</body>
</html>
"#;

/// Converts the browser's local datetimes to UTC before posting.
pub const TEST_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Test Appointment Booking</title></head>
<body>
    <h2>Test Appointment Booking</h2>
    <form id="bookingForm">
        <label for="summary">Appointment Title:</label><br>
        <input type="text" id="summary" value="Test Dental Appointment"><br><br>

        <label for="startTime">Start Date &amp; Time:</label><br>
        <input type="datetime-local" id="startTime"><br><br>

        <label for="endTime">End Date &amp; Time:</label><br>
        <input type="datetime-local" id="endTime"><br><br>

        <button type="button" onclick="bookAppointment()">Book Appointment</button>
    </form>

    <div id="result"></div>

    <script>
        function toLocalInput(date) {
            const offset = date.getTimezoneOffset() * 60000;
            return new Date(date.getTime() - offset).toISOString().slice(0, 16);
        }

        const start = new Date(Date.now() + 60 * 60 * 1000);
        const end = new Date(start.getTime() + 60 * 60 * 1000);
        document.getElementById('startTime').value = toLocalInput(start);
        document.getElementById('endTime').value = toLocalInput(end);

        function showResult(color, text, link) {
            const result = document.getElementById('result');
            const message = document.createElement('p');
            message.style.color = color;
            message.textContent = text;
            result.replaceChildren(message);

            if (link) {
                const anchor = document.createElement('a');
                anchor.href = link;
                anchor.target = '_blank';
                anchor.rel = 'noopener';
                anchor.textContent = 'View in Google Calendar';
                result.appendChild(anchor);
            }
        }

        function bookAppointment() {
            const payload = {
                summary: document.getElementById('summary').value,
                start_time: new Date(document.getElementById('startTime').value).toISOString(),
                end_time: new Date(document.getElementById('endTime').value).toISOString()
            };

            fetch('/add_event', {
                method: 'POST',
                headers: {'Content-Type': 'application/json'},
                body: JSON.stringify(payload)
            })
            .then(response => response.json())
            .then(data => {
                if (data.status === 'success') {
                    showResult('green', 'Appointment booked successfully!', data.eventLink);
                } else {
                    showResult('red', 'Error: ' + (data.error || 'Unknown error'));
                }
            })
            .catch(error => showResult('red', 'Error: ' + error));
        }
    </script>
</body>
</html>
"#;

pub const CONNECTED_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Google Calendar connected</title></head>
<body>
    <p>Google Calendar connected successfully! You can now close this tab.</p>
</body>
</html>
"#;
